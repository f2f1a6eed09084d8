use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CareError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PersonId(pub Ulid);

impl PersonId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a person id from its canonical ULID text form.
    ///
    /// # Errors
    /// Returns [`CareError::Validation`] when the input is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self, CareError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| CareError::Validation(format!("invalid person id '{value}': {err}")))
    }
}

impl Default for PersonId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PersonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an event id from its canonical ULID text form.
    ///
    /// # Errors
    /// Returns [`CareError::Validation`] when the input is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self, CareError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| CareError::Validation(format!("invalid event id '{value}': {err}")))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub Ulid);

impl ContactId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses a contact id from its canonical ULID text form.
    ///
    /// # Errors
    /// Returns [`CareError::Validation`] when the input is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self, CareError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| CareError::Validation(format!("invalid contact id '{value}': {err}")))
    }
}

impl Default for ContactId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    CognitiveDrift,
    Emotional,
    Scam,
    Silence,
    Medication,
    HelpRequest,
    Environmental,
}

impl SignalCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CognitiveDrift => "cognitive_drift",
            Self::Emotional => "emotional",
            Self::Scam => "scam",
            Self::Silence => "silence",
            Self::Medication => "medication",
            Self::HelpRequest => "help_request",
            Self::Environmental => "environmental",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cognitive_drift" => Some(Self::CognitiveDrift),
            "emotional" => Some(Self::Emotional),
            "scam" => Some(Self::Scam),
            "silence" => Some(Self::Silence),
            "medication" => Some(Self::Medication),
            "help_request" => Some(Self::HelpRequest),
            "environmental" => Some(Self::Environmental),
            _ => None,
        }
    }

    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            Self::Scam => 1.5,
            Self::HelpRequest => 1.4,
            Self::Environmental => 1.3,
            Self::Silence => 1.1,
            Self::CognitiveDrift | Self::Emotional => 1.0,
            Self::Medication => 0.8,
        }
    }

    /// Contact eligibility family for this category. `help_request` has no
    /// family: every active contact is eligible for it.
    #[must_use]
    pub fn contact_family(self) -> Option<ContactFamily> {
        match self {
            Self::Scam => Some(ContactFamily::Scam),
            Self::Emotional => Some(ContactFamily::Emotional),
            Self::Silence => Some(ContactFamily::Silence),
            Self::CognitiveDrift => Some(ContactFamily::Cognitive),
            Self::Medication | Self::Environmental => Some(ContactFamily::Routine),
            Self::HelpRequest => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContactFamily {
    Scam,
    Emotional,
    Silence,
    Cognitive,
    Routine,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Conservative,
    Balanced,
    Protective,
}

impl Sensitivity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Protective => "protective",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conservative" => Some(Self::Conservative),
            "balanced" => Some(Self::Balanced),
            "protective" => Some(Self::Protective),
            _ => None,
        }
    }

    #[must_use]
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Conservative => 0.7,
            Self::Balanced => 1.0,
            Self::Protective => 1.4,
        }
    }

    /// Threshold bias: shifts every tier boundary by this amount.
    #[must_use]
    pub fn bias(self) -> i16 {
        match self {
            Self::Conservative => 1,
            Self::Balanced => 0,
            Self::Protective => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScamThreshold {
    Low,
    Medium,
    High,
}

impl ScamThreshold {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutreachChannel {
    Whatsapp,
    Sms,
}

impl OutreachChannel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Whatsapp => "whatsapp",
            Self::Sms => "sms",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "whatsapp" => Some(Self::Whatsapp),
            "sms" => Some(Self::Sms),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Pending,
    Resolved,
    FalseAlarm,
    Escalated,
}

impl EventOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::FalseAlarm => "false_alarm",
            Self::Escalated => "escalated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "false_alarm" => Some(Self::FalseAlarm),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoredPerson {
    pub person_id: PersonId,
    pub display_name: String,
    pub phone_number: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CareSettings {
    pub person_id: PersonId,
    pub care_enabled: bool,
    pub ai_first_contact: bool,
    pub sensitivity: Sensitivity,
    pub silence_window_hours: i64,
    pub scam_threshold: ScamThreshold,
    pub max_outreach_per_week: u32,
    pub escalation_cooldown_hours: i64,
}

impl CareSettings {
    /// Default settings applied on first signal when no row exists yet.
    #[must_use]
    pub fn defaults(person_id: PersonId) -> Self {
        Self {
            person_id,
            care_enabled: true,
            ai_first_contact: true,
            sensitivity: Sensitivity::Balanced,
            silence_window_hours: 48,
            scam_threshold: ScamThreshold::Medium,
            max_outreach_per_week: 3,
            escalation_cooldown_hours: 4,
        }
    }

    /// Validates settings bounds.
    ///
    /// # Errors
    /// Returns [`CareError::Configuration`] when a field is outside its
    /// allowed range.
    pub fn validate(&self) -> Result<(), CareError> {
        if self.max_outreach_per_week < 1 {
            return Err(CareError::Configuration(
                "max_outreach_per_week MUST be >= 1".to_string(),
            ));
        }
        if self.silence_window_hours < 1 {
            return Err(CareError::Configuration(
                "silence_window_hours MUST be >= 1".to_string(),
            ));
        }
        if self.escalation_cooldown_hours < 0 {
            return Err(CareError::Configuration(
                "escalation_cooldown_hours MUST be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A wellbeing signal submitted by an upstream producer or synthesized by
/// the silence monitor. Raw risk outside [1, 10] is clamped on construction,
/// never rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CareSignal {
    pub person_id: PersonId,
    pub category: SignalCategory,
    pub raw_risk: u8,
    pub description: String,
    pub rationale: Option<String>,
}

impl CareSignal {
    #[must_use]
    pub fn new(
        person_id: PersonId,
        category: SignalCategory,
        raw_risk: i64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            person_id,
            category,
            raw_risk: clamp_raw_risk(raw_risk),
            description: description.into(),
            rationale: None,
        }
    }

    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

#[must_use]
pub fn clamp_raw_risk(value: i64) -> u8 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        value.clamp(1, 10) as u8
    }
}

/// One append-only audit row per evaluated signal. `escalation_layer`,
/// `risk_score`, and `category` never change after creation; `outcome` is
/// set later by a reviewer and the two external-contact fields are set once
/// by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CareEvent {
    pub event_id: EventId,
    pub person_id: PersonId,
    pub category: SignalCategory,
    pub risk_score: u8,
    pub escalation_layer: u8,
    pub description: String,
    pub ai_action: String,
    pub ai_contacted_elderly: bool,
    pub external_contact_id: Option<ContactId>,
    pub external_contact_method: Option<OutreachChannel>,
    pub outcome: EventOutcome,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustedContact {
    pub contact_id: ContactId,
    pub person_id: PersonId,
    pub name: String,
    pub priority_order: u32,
    /// Insertion order, used to break priority ties.
    pub inserted_seq: i64,
    pub phone_number: String,
    pub outreach_methods: Vec<OutreachChannel>,
    pub is_active: bool,
    pub notify_scam: bool,
    pub notify_emotional: bool,
    pub notify_silence: bool,
    pub notify_cognitive: bool,
    pub notify_routine: bool,
}

impl TrustedContact {
    #[must_use]
    pub fn eligible_for(&self, category: SignalCategory) -> bool {
        if !self.is_active {
            return false;
        }
        match category.contact_family() {
            None => true,
            Some(ContactFamily::Scam) => self.notify_scam,
            Some(ContactFamily::Emotional) => self.notify_emotional,
            Some(ContactFamily::Silence) => self.notify_silence,
            Some(ContactFamily::Cognitive) => self.notify_cognitive,
            Some(ContactFamily::Routine) => self.notify_routine,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BehavioralBaseline {
    pub person_id: PersonId,
    pub avg_daily_conversations: f64,
    /// 0-100 scale, scaled from the 0-5 mood input.
    pub avg_mood_score: f64,
    pub avg_conversation_minutes: f64,
    pub last_interaction: Option<OffsetDateTime>,
    pub refreshed_at: OffsetDateTime,
}

/// One row of the upstream wellbeing feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WellbeingSample {
    pub mood_score: f64,
    pub conversation_count: u32,
    pub conversation_minutes: f64,
    pub logged_at: OffsetDateTime,
}

/// Recomputes the rolling baseline from scratch. An empty sample set yields
/// zero averages, not an error.
#[must_use]
pub fn compute_baseline(
    person_id: PersonId,
    samples: &[WellbeingSample],
    last_interaction: Option<OffsetDateTime>,
    refreshed_at: OffsetDateTime,
) -> BehavioralBaseline {
    if samples.is_empty() {
        return BehavioralBaseline {
            person_id,
            avg_daily_conversations: 0.0,
            avg_mood_score: 0.0,
            avg_conversation_minutes: 0.0,
            last_interaction,
            refreshed_at,
        };
    }

    #[allow(clippy::cast_precision_loss)]
    let count = samples.len() as f64;
    let mood_sum: f64 = samples.iter().map(|sample| sample.mood_score).sum();
    let conversations_sum: f64 = samples
        .iter()
        .map(|sample| f64::from(sample.conversation_count))
        .sum();
    let minutes_sum: f64 = samples
        .iter()
        .map(|sample| sample.conversation_minutes)
        .sum();

    BehavioralBaseline {
        person_id,
        avg_daily_conversations: conversations_sum / count,
        avg_mood_score: ((mood_sum / count) * 20.0).clamp(0.0, 100.0),
        avg_conversation_minutes: minutes_sum / count,
        last_interaction,
        refreshed_at,
    }
}

/// Raw risk for a synthetic silence signal: scales linearly with how far
/// past the configured window the person has been silent.
#[must_use]
pub fn silence_raw_risk(hours_since: f64, silence_window_hours: i64) -> u8 {
    let window = silence_window_hours.max(1);
    #[allow(clippy::cast_precision_loss)]
    let ratio = hours_since / window as f64;
    clamp_raw_risk(round_half_up(ratio * 5.0))
}

/// Per-person history the suppression rules need, read under the same
/// transaction that will append the new event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistorySnapshot {
    /// Most recent event that led to an action (layer >= 1).
    pub last_actionable_at: Option<OffsetDateTime>,
    /// Events with layer >= 2 in the trailing 7 days.
    pub weekly_action_count: u32,
    /// All events for this person in the trailing 48 hours.
    pub events_last_48h: u32,
    /// Events marked `false_alarm` in the trailing 7 days.
    pub false_alarms_last_7d: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    Disabled,
    Cooldown,
    Threshold,
    CorroborationDowngrade,
    FalseAlarmDowngrade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationDecision {
    pub layer: u8,
    pub adjusted_risk: u8,
    pub rationale: String,
    pub rule: DecisionRule,
    /// Weekly outreach cap reached: blocks the trusted-circle side effect
    /// at layer >= 3, never the tier itself.
    pub at_cap: bool,
}

/// Adjusted risk: raw scaled by category weight and sensitivity multiplier,
/// clamped to [0, 10], rounded half-up.
#[must_use]
pub fn adjusted_risk(raw_risk: u8, category: SignalCategory, sensitivity: Sensitivity) -> u8 {
    let scaled = f64::from(raw_risk) * category.weight() * sensitivity.multiplier();
    let rounded = round_half_up(scaled.min(10.0));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        rounded.clamp(0, 10) as u8
    }
}

/// Tier lookup over adjusted risk, with the sensitivity bias shifting every
/// boundary. All comparisons are inclusive on the upper bound.
#[must_use]
pub fn layer_for_adjusted_risk(adjusted: u8, sensitivity: Sensitivity) -> u8 {
    let value = i16::from(adjusted);
    let bias = sensitivity.bias();
    if value <= 2 + bias {
        0
    } else if value <= 4 + bias {
        1
    } else if value <= 6 + bias {
        2
    } else if value <= 8 + bias {
        3
    } else {
        4
    }
}

const SEVERITY_BYPASS_RISK: u8 = 8;
const CORROBORATION_MIN_EVENTS_48H: u32 = 2;
const FALSE_ALARM_MAX_RAW: u8 = 7;

/// The escalation decision core. Pure: all temporal state arrives in
/// `history`, so every suppression rule is testable in isolation.
#[must_use]
pub fn decide_escalation(
    signal: &CareSignal,
    settings: &CareSettings,
    history: &HistorySnapshot,
    now: OffsetDateTime,
) -> EscalationDecision {
    let at_cap = history.weekly_action_count >= settings.max_outreach_per_week;

    if !settings.care_enabled {
        return EscalationDecision {
            layer: 0,
            adjusted_risk: adjusted_risk(signal.raw_risk, signal.category, settings.sensitivity),
            rationale: "observation only: care monitoring disabled".to_string(),
            rule: DecisionRule::Disabled,
            at_cap,
        };
    }

    if signal.raw_risk < SEVERITY_BYPASS_RISK {
        if let Some(last) = history.last_actionable_at {
            let cooldown = Duration::hours(settings.escalation_cooldown_hours);
            if now - last < cooldown {
                return EscalationDecision {
                    layer: 0,
                    adjusted_risk: adjusted_risk(
                        signal.raw_risk,
                        signal.category,
                        settings.sensitivity,
                    ),
                    rationale: format!(
                        "within cooldown: last action at {last}, cooldown {}h",
                        settings.escalation_cooldown_hours
                    ),
                    rule: DecisionRule::Cooldown,
                    at_cap,
                };
            }
        }
    }

    let adjusted = adjusted_risk(signal.raw_risk, signal.category, settings.sensitivity);
    let mut layer = layer_for_adjusted_risk(adjusted, settings.sensitivity);
    let mut rule = DecisionRule::Threshold;
    let mut rationale = format!(
        "adjusted risk {adjusted} ({} raw {}, weight {:.1}, {} x{:.1}) -> layer {layer}",
        signal.category.as_str(),
        signal.raw_risk,
        signal.category.weight(),
        settings.sensitivity.as_str(),
        settings.sensitivity.multiplier(),
    );

    if layer >= 3
        && signal.raw_risk < SEVERITY_BYPASS_RISK
        && history.events_last_48h < CORROBORATION_MIN_EVENTS_48H
    {
        layer = 2;
        rule = DecisionRule::CorroborationDowngrade;
        rationale.push_str(&format!(
            "; downgraded to 2: only {} signal(s) in 48h, corroboration requires {}",
            history.events_last_48h, CORROBORATION_MIN_EVENTS_48H
        ));
    }

    if history.false_alarms_last_7d >= 1 && layer >= 2 && signal.raw_risk < FALSE_ALARM_MAX_RAW {
        layer = layer.saturating_sub(1);
        rule = DecisionRule::FalseAlarmDowngrade;
        rationale.push_str(&format!(
            "; downgraded to {layer}: {} false alarm(s) in the last 7 days",
            history.false_alarms_last_7d
        ));
    }

    EscalationDecision {
        layer,
        adjusted_risk: adjusted,
        rationale,
        rule,
        at_cap,
    }
}

/// Whether the dispatcher should skip straight to the trusted circle:
/// layer 4, or layer 3 carried by a severe raw score.
#[must_use]
pub fn requires_circle_notification(layer: u8, raw_risk: u8) -> bool {
    layer == 4 || (layer >= 3 && raw_risk >= SEVERITY_BYPASS_RISK)
}

/// Low-alarm script spoken to the monitored person on a direct-contact
/// attempt. Deliberately avoids alarming language for every category.
#[must_use]
pub fn direct_contact_script(category: SignalCategory, person_name: &str) -> String {
    match category {
        SignalCategory::Scam => format!(
            "Hola {person_name}, soy tu asistente. Quería recordarte no compartir \
             datos bancarios ni códigos por teléfono. ¿Todo bien por ahí?"
        ),
        SignalCategory::Emotional => format!(
            "Hola {person_name}, solo quería saludarte y preguntarte cómo te sientes hoy."
        ),
        SignalCategory::Silence => format!(
            "Hola {person_name}, hace un tiempo que no conversamos. ¿Cómo estás?"
        ),
        SignalCategory::CognitiveDrift => format!(
            "Hola {person_name}, ¿te gustaría que repasemos juntos los planes de hoy?"
        ),
        SignalCategory::Medication => format!(
            "Hola {person_name}, un recordatorio amable sobre tus medicamentos. \
             ¿Ya los tomaste hoy?"
        ),
        SignalCategory::HelpRequest => format!(
            "Hola {person_name}, recibí tu mensaje. Estoy aquí contigo, ¿me cuentas qué pasa?"
        ),
        SignalCategory::Environmental => format!(
            "Hola {person_name}, ¿está todo en orden en casa? Quería asegurarme."
        ),
    }
}

/// Alert sent to a trusted contact, naming the monitored person. The SMS
/// rendering is a compact single line; WhatsApp carries the fuller text.
#[must_use]
pub fn circle_alert_message(
    category: SignalCategory,
    channel: OutreachChannel,
    person_name: &str,
    risk_score: u8,
) -> String {
    let concern = match category {
        SignalCategory::Scam => "a possible scam attempt",
        SignalCategory::Emotional => "signs of emotional distress",
        SignalCategory::Silence => "an unusually long period without contact",
        SignalCategory::CognitiveDrift => "signs of confusion or disorientation",
        SignalCategory::Medication => "a possible missed medication",
        SignalCategory::HelpRequest => "a direct request for help",
        SignalCategory::Environmental => "a possible problem at home",
    };
    match channel {
        OutreachChannel::Whatsapp => format!(
            "CareCircle alert: we detected {concern} involving {person_name} \
             (risk {risk_score}/10). Please check in with them when you can. \
             Reply to this message once you have made contact."
        ),
        OutreachChannel::Sms => format!(
            "CareCircle: {concern} involving {person_name} (risk {risk_score}/10). \
             Please check in."
        ),
    }
}

/// Round-half-up on a non-negative scale, per the engine's tie-break policy.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CareError::Validation`] when parsing fails or the input is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CareError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CareError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CareError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CareError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CareError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CareError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn hours_between(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }
    let elapsed = later - earlier;
    elapsed.as_seconds_f64() / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixture_person() -> PersonId {
        PersonId::new()
    }

    fn fixture_settings(sensitivity: Sensitivity) -> CareSettings {
        let mut settings = CareSettings::defaults(fixture_person());
        settings.sensitivity = sensitivity;
        settings
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        match parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("expected valid timestamp: {err}"),
        }
    }

    #[test]
    fn raw_risk_is_clamped_not_rejected() {
        let person = fixture_person();
        let low = CareSignal::new(person, SignalCategory::Emotional, -3, "low");
        let high = CareSignal::new(person, SignalCategory::Emotional, 99, "high");
        assert_eq!(low.raw_risk, 1);
        assert_eq!(high.raw_risk, 10);
    }

    #[test]
    fn adjusted_risk_rounds_half_up_and_clamps() {
        // 5 * 1.1 * 1.0 = 5.5 -> 6
        assert_eq!(
            adjusted_risk(5, SignalCategory::Silence, Sensitivity::Balanced),
            6
        );
        // 10 * 1.5 * 1.4 = 21 -> clamped to 10
        assert_eq!(
            adjusted_risk(10, SignalCategory::Scam, Sensitivity::Protective),
            10
        );
        // 5 * 0.8 * 0.7 = 2.8 -> 3
        assert_eq!(
            adjusted_risk(5, SignalCategory::Medication, Sensitivity::Conservative),
            3
        );
    }

    #[test]
    fn layer_boundaries_are_inclusive() {
        assert_eq!(layer_for_adjusted_risk(2, Sensitivity::Balanced), 0);
        assert_eq!(layer_for_adjusted_risk(3, Sensitivity::Balanced), 1);
        assert_eq!(layer_for_adjusted_risk(4, Sensitivity::Balanced), 1);
        assert_eq!(layer_for_adjusted_risk(6, Sensitivity::Balanced), 2);
        assert_eq!(layer_for_adjusted_risk(8, Sensitivity::Balanced), 3);
        assert_eq!(layer_for_adjusted_risk(9, Sensitivity::Balanced), 4);
        // Bias shifts every boundary.
        assert_eq!(layer_for_adjusted_risk(3, Sensitivity::Conservative), 0);
        assert_eq!(layer_for_adjusted_risk(3, Sensitivity::Protective), 1);
    }

    #[test]
    fn disabled_care_always_yields_layer_zero() {
        let mut settings = fixture_settings(Sensitivity::Protective);
        settings.care_enabled = false;
        let signal = CareSignal::new(settings.person_id, SignalCategory::Scam, 10, "urgent");

        let decision = decide_escalation(
            &signal,
            &settings,
            &HistorySnapshot::default(),
            now_utc(),
        );

        assert_eq!(decision.layer, 0);
        assert_eq!(decision.rule, DecisionRule::Disabled);
    }

    #[test]
    fn cooldown_suppresses_moderate_signals() {
        let settings = fixture_settings(Sensitivity::Balanced);
        let now = must_utc("2026-03-01T12:00:00Z");
        let history = HistorySnapshot {
            last_actionable_at: Some(must_utc("2026-03-01T10:30:00Z")),
            ..HistorySnapshot::default()
        };
        let signal = CareSignal::new(settings.person_id, SignalCategory::Scam, 7, "repeat");

        let decision = decide_escalation(&signal, &settings, &history, now);

        assert_eq!(decision.layer, 0);
        assert_eq!(decision.rule, DecisionRule::Cooldown);
    }

    #[test]
    fn severity_eight_bypasses_cooldown() {
        let settings = fixture_settings(Sensitivity::Balanced);
        let now = must_utc("2026-03-01T12:00:00Z");
        let history = HistorySnapshot {
            last_actionable_at: Some(must_utc("2026-03-01T11:30:00Z")),
            events_last_48h: 3,
            ..HistorySnapshot::default()
        };
        let signal = CareSignal::new(settings.person_id, SignalCategory::Scam, 8, "severe");

        let decision = decide_escalation(&signal, &settings, &history, now);

        assert_ne!(decision.rule, DecisionRule::Cooldown);
        assert!(decision.layer >= 3);
    }

    #[test]
    fn lone_moderate_signal_is_downgraded_by_corroboration() {
        // raw 5 emotional under protective: 5 * 1.0 * 1.4 = 7 -> layer 3
        // (protective boundaries 1/3/5/7), zero other events in 48h.
        let settings = fixture_settings(Sensitivity::Protective);
        let signal = CareSignal::new(settings.person_id, SignalCategory::Emotional, 5, "lonely");

        let decision = decide_escalation(
            &signal,
            &settings,
            &HistorySnapshot::default(),
            now_utc(),
        );

        assert_eq!(decision.layer, 2);
        assert_eq!(decision.rule, DecisionRule::CorroborationDowngrade);
    }

    #[test]
    fn corroborated_signal_keeps_its_layer() {
        let settings = fixture_settings(Sensitivity::Protective);
        let history = HistorySnapshot {
            events_last_48h: 2,
            ..HistorySnapshot::default()
        };
        let signal = CareSignal::new(settings.person_id, SignalCategory::Emotional, 5, "lonely");

        let decision = decide_escalation(&signal, &settings, &history, now_utc());

        assert_eq!(decision.layer, 3);
        assert_eq!(decision.rule, DecisionRule::Threshold);
    }

    #[test]
    fn false_alarm_feedback_downgrades_by_exactly_one() {
        // raw 6 scam balanced: 6 * 1.5 = 9 -> layer... 9 > 8 would be 4; use
        // raw 5: 7.5 -> 8 -> layer 3, corroborated, then false alarm -> 2.
        let settings = fixture_settings(Sensitivity::Balanced);
        let history = HistorySnapshot {
            events_last_48h: 3,
            false_alarms_last_7d: 1,
            ..HistorySnapshot::default()
        };
        let signal = CareSignal::new(settings.person_id, SignalCategory::Scam, 5, "caller");

        let decision = decide_escalation(&signal, &settings, &history, now_utc());

        assert_eq!(decision.layer, 2);
        assert_eq!(decision.rule, DecisionRule::FalseAlarmDowngrade);
    }

    #[test]
    fn raw_six_layer_three_becomes_two_after_false_alarm() {
        // raw 6 environmental balanced: 6 * 1.3 = 7.8 -> 8 -> layer 3.
        let settings = fixture_settings(Sensitivity::Balanced);
        let history = HistorySnapshot {
            events_last_48h: 2,
            false_alarms_last_7d: 1,
            ..HistorySnapshot::default()
        };
        let signal =
            CareSignal::new(settings.person_id, SignalCategory::Environmental, 6, "smoke");

        let decision = decide_escalation(&signal, &settings, &history, now_utc());

        assert_eq!(decision.layer, 2);
        assert_eq!(decision.rule, DecisionRule::FalseAlarmDowngrade);
    }

    #[test]
    fn false_alarm_feedback_ignores_severe_signals() {
        let settings = fixture_settings(Sensitivity::Balanced);
        let history = HistorySnapshot {
            events_last_48h: 3,
            false_alarms_last_7d: 2,
            ..HistorySnapshot::default()
        };
        let signal = CareSignal::new(settings.person_id, SignalCategory::Scam, 7, "caller");

        let decision = decide_escalation(&signal, &settings, &history, now_utc());

        assert_eq!(decision.rule, DecisionRule::Threshold);
    }

    #[test]
    fn weekly_cap_marks_but_never_suppresses() {
        let settings = fixture_settings(Sensitivity::Balanced);
        let history = HistorySnapshot {
            weekly_action_count: settings.max_outreach_per_week,
            events_last_48h: 2,
            ..HistorySnapshot::default()
        };
        let signal = CareSignal::new(settings.person_id, SignalCategory::Scam, 8, "severe");

        let decision = decide_escalation(&signal, &settings, &history, now_utc());

        assert!(decision.at_cap);
        assert!(decision.layer >= 3);
    }

    #[test]
    fn circle_notification_rule_matches_severity() {
        assert!(requires_circle_notification(4, 5));
        assert!(requires_circle_notification(3, 8));
        assert!(!requires_circle_notification(3, 7));
        assert!(!requires_circle_notification(2, 10));
    }

    #[test]
    fn help_request_is_always_eligible() {
        let contact = TrustedContact {
            contact_id: ContactId::new(),
            person_id: fixture_person(),
            name: "Ana".to_string(),
            priority_order: 1,
            inserted_seq: 1,
            phone_number: "+5215512345678".to_string(),
            outreach_methods: vec![OutreachChannel::Whatsapp],
            is_active: true,
            notify_scam: false,
            notify_emotional: false,
            notify_silence: false,
            notify_cognitive: false,
            notify_routine: false,
        };
        assert!(contact.eligible_for(SignalCategory::HelpRequest));
        assert!(!contact.eligible_for(SignalCategory::Scam));
        assert!(!contact.eligible_for(SignalCategory::Medication));
    }

    #[test]
    fn inactive_contact_is_never_eligible() {
        let contact = TrustedContact {
            contact_id: ContactId::new(),
            person_id: fixture_person(),
            name: "Ana".to_string(),
            priority_order: 1,
            inserted_seq: 1,
            phone_number: "+5215512345678".to_string(),
            outreach_methods: vec![OutreachChannel::Sms],
            is_active: false,
            notify_scam: true,
            notify_emotional: true,
            notify_silence: true,
            notify_cognitive: true,
            notify_routine: true,
        };
        assert!(!contact.eligible_for(SignalCategory::HelpRequest));
    }

    #[test]
    fn empty_wellbeing_log_yields_zero_averages() {
        let baseline = compute_baseline(fixture_person(), &[], None, now_utc());
        assert!((baseline.avg_mood_score - 0.0).abs() < f64::EPSILON);
        assert!((baseline.avg_daily_conversations - 0.0).abs() < f64::EPSILON);
        assert!(baseline.last_interaction.is_none());
    }

    #[test]
    fn baseline_scales_mood_to_hundred() {
        let samples = vec![
            WellbeingSample {
                mood_score: 4.0,
                conversation_count: 3,
                conversation_minutes: 12.0,
                logged_at: now_utc(),
            },
            WellbeingSample {
                mood_score: 2.0,
                conversation_count: 1,
                conversation_minutes: 4.0,
                logged_at: now_utc(),
            },
        ];
        let baseline = compute_baseline(fixture_person(), &samples, None, now_utc());
        assert!((baseline.avg_mood_score - 60.0).abs() < 0.0001);
        assert!((baseline.avg_daily_conversations - 2.0).abs() < 0.0001);
        assert!((baseline.avg_conversation_minutes - 8.0).abs() < 0.0001);
    }

    #[test]
    fn silence_risk_scales_with_window_overrun() {
        // Exactly at the window: ratio 1.0 -> 5.
        assert_eq!(silence_raw_risk(48.0, 48), 5);
        // Twice the window: ratio 2.0 -> 10.
        assert_eq!(silence_raw_risk(96.0, 48), 10);
        // Far past the window clamps at 10.
        assert_eq!(silence_raw_risk(500.0, 48), 10);
        // Just past the window still yields a moderate score.
        assert_eq!(silence_raw_risk(50.0, 48), 5);
    }

    #[test]
    fn settings_validation_rejects_zero_cap() {
        let mut settings = CareSettings::defaults(fixture_person());
        settings.max_outreach_per_week = 0;
        assert!(settings.validate().is_err());
    }

    proptest! {
        #[test]
        fn layer_is_monotonic_in_adjusted_risk(
            low in 0_u8..=10,
            high in 0_u8..=10,
            sensitivity_index in 0_u8..3,
        ) {
            let sensitivity = match sensitivity_index {
                0 => Sensitivity::Conservative,
                1 => Sensitivity::Balanced,
                _ => Sensitivity::Protective,
            };
            let (lower, upper) = if low <= high { (low, high) } else { (high, low) };
            prop_assert!(
                layer_for_adjusted_risk(lower, sensitivity)
                    <= layer_for_adjusted_risk(upper, sensitivity)
            );
        }

        #[test]
        fn adjusted_risk_is_monotonic_in_raw(
            low in 1_u8..=10,
            high in 1_u8..=10,
            category_index in 0_u8..7,
            sensitivity_index in 0_u8..3,
        ) {
            let category = match category_index {
                0 => SignalCategory::CognitiveDrift,
                1 => SignalCategory::Emotional,
                2 => SignalCategory::Scam,
                3 => SignalCategory::Silence,
                4 => SignalCategory::Medication,
                5 => SignalCategory::HelpRequest,
                _ => SignalCategory::Environmental,
            };
            let sensitivity = match sensitivity_index {
                0 => Sensitivity::Conservative,
                1 => Sensitivity::Balanced,
                _ => Sensitivity::Protective,
            };
            let (lower, upper) = if low <= high { (low, high) } else { (high, low) };
            prop_assert!(
                adjusted_risk(lower, category, sensitivity)
                    <= adjusted_risk(upper, category, sensitivity)
            );
        }
    }
}
