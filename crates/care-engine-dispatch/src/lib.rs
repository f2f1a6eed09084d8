#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use care_engine_core::{
    circle_alert_message, direct_contact_script, requires_circle_notification, CareEvent,
    ContactId, MonitoredPerson, OutreachChannel, PersonId, TrustedContact,
};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Telephony collaborator: places a low-alarm advisory call to the
/// monitored person. Failures are advisory and never retried here.
pub trait TelephonyDispatch {
    fn place_advisory_call(
        &self,
        phone_number: &str,
        person_id: PersonId,
        script_message: &str,
    ) -> Result<()>;
}

/// Messaging collaborator: delivers one trusted-circle alert over a
/// concrete channel.
pub trait MessagingGateway {
    fn send_message(&self, channel: OutreachChannel, to_number: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub phone_number: String,
    pub person_id: PersonId,
    pub script_message: String,
}

/// Recording telephony stub for tests; can be scripted to fail.
#[derive(Debug, Default)]
pub struct MockTelephony {
    fail: bool,
    calls: Mutex<Vec<CallRecord>>,
}

impl MockTelephony {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TelephonyDispatch for MockTelephony {
    fn place_advisory_call(
        &self,
        phone_number: &str,
        person_id: PersonId,
        script_message: &str,
    ) -> Result<()> {
        if let Ok(mut guard) = self.calls.lock() {
            guard.push(CallRecord {
                phone_number: phone_number.to_string(),
                person_id,
                script_message: script_message.to_string(),
            });
        }
        if self.fail {
            return Err(anyhow!("mock telephony configured to fail"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub channel: OutreachChannel,
    pub to_number: String,
    pub body: String,
}

/// Recording messaging stub for tests; individual channels can be
/// scripted to fail so fallback order is observable.
#[derive(Debug, Default)]
pub struct MockMessaging {
    failing_channels: Vec<OutreachChannel>,
    messages: Mutex<Vec<MessageRecord>>,
}

impl MockMessaging {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_on(channels: Vec<OutreachChannel>) -> Self {
        Self {
            failing_channels: channels,
            messages: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn messages(&self) -> Vec<MessageRecord> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MessagingGateway for MockMessaging {
    fn send_message(&self, channel: OutreachChannel, to_number: &str, body: &str) -> Result<()> {
        if self.failing_channels.contains(&channel) {
            return Err(anyhow!("mock gateway configured to fail on {}", channel.as_str()));
        }
        if let Ok(mut guard) = self.messages.lock() {
            guard.push(MessageRecord {
                channel,
                to_number: to_number.to_string(),
                body: body.to_string(),
            });
        }
        Ok(())
    }
}

/// Telephony stand-in for runs without a voice provider: logs the call it
/// would have placed and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunTelephony;

impl TelephonyDispatch for DryRunTelephony {
    fn place_advisory_call(
        &self,
        phone_number: &str,
        person_id: PersonId,
        script_message: &str,
    ) -> Result<()> {
        info!(
            person_id = %person_id,
            phone_number,
            script_message,
            "dry-run: advisory call"
        );
        Ok(())
    }
}

/// Messaging stand-in that logs instead of sending.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunMessaging;

impl MessagingGateway for DryRunMessaging {
    fn send_message(&self, channel: OutreachChannel, to_number: &str, body: &str) -> Result<()> {
        info!(
            channel = channel.as_str(),
            to_number,
            body,
            "dry-run: circle message"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpChannelConfig {
    url: String,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    auth_bearer_token: Option<String>,
}

impl HttpChannelConfig {
    /// Builds a channel endpoint config from a JSON params object:
    /// `url` (required), `timeout_ms`, `headers`, `auth_bearer_env`.
    pub fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("channel config requires params.url"))?
            .to_string();

        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(10_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value.as_str().ok_or_else(|| {
                    anyhow!("params.headers values must be strings, key='{key}'")
                })?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let auth_bearer_token =
            if let Some(env_name) = params.get("auth_bearer_env").and_then(Value::as_str) {
                Some(std::env::var(env_name).map_err(|_| {
                    anyhow!("missing env var '{env_name}' required by params.auth_bearer_env")
                })?)
            } else {
                None
            };

        Ok(Self {
            url,
            timeout_ms,
            headers,
            auth_bearer_token,
        })
    }

    fn post_json(&self, payload: &Value) -> Result<()> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.url)
            .set("content-type", "application/json");
        for (header, value) in &self.headers {
            req = req.set(header, value);
        }
        if let Some(token) = &self.auth_bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }

        match req.send_json(payload) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!("channel endpoint returned {code}")),
            Err(ureq::Error::Transport(err)) => Err(anyhow!("channel transport failure: {err}")),
        }
    }
}

/// Telephony over an HTTP voice-agent endpoint.
#[derive(Debug, Clone)]
pub struct HttpTelephony {
    config: HttpChannelConfig,
}

impl HttpTelephony {
    #[must_use]
    pub fn new(config: HttpChannelConfig) -> Self {
        Self { config }
    }
}

impl TelephonyDispatch for HttpTelephony {
    fn place_advisory_call(
        &self,
        phone_number: &str,
        person_id: PersonId,
        script_message: &str,
    ) -> Result<()> {
        self.config.post_json(&json!({
            "phone_number": phone_number,
            "person_id": person_id.to_string(),
            "script_message": script_message,
        }))
    }
}

/// Messaging over an HTTP gateway endpoint.
#[derive(Debug, Clone)]
pub struct HttpMessaging {
    config: HttpChannelConfig,
}

impl HttpMessaging {
    #[must_use]
    pub fn new(config: HttpChannelConfig) -> Self {
        Self { config }
    }
}

impl MessagingGateway for HttpMessaging {
    fn send_message(&self, channel: OutreachChannel, to_number: &str, body: &str) -> Result<()> {
        self.config.post_json(&json!({
            "channel": channel.as_str(),
            "to_number": to_number,
            "body": body,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectContactResult {
    NotAttempted,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircleResult {
    NotRequired,
    Notified {
        contact_id: ContactId,
        channel: OutreachChannel,
    },
    BlockedByCap,
    NoEligibleContact,
    Failed(String),
}

/// Outcome of one dispatch pass. `notes` are audit strings for the event's
/// `ai_action` trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub direct_contact: DirectContactResult,
    pub circle: CircleResult,
    pub notes: Vec<String>,
}

pub struct DispatchRequest<'a> {
    pub event: &'a CareEvent,
    pub person: &'a MonitoredPerson,
    pub contacts: &'a [TrustedContact],
    pub ai_first_contact: bool,
    pub at_cap: bool,
}

/// Executes the tier action table: at most one direct-contact attempt and
/// at most one trusted-circle message per event.
pub struct ContactDispatcher<'a> {
    telephony: &'a dyn TelephonyDispatch,
    messaging: &'a dyn MessagingGateway,
}

impl<'a> ContactDispatcher<'a> {
    #[must_use]
    pub fn new(telephony: &'a dyn TelephonyDispatch, messaging: &'a dyn MessagingGateway) -> Self {
        Self {
            telephony,
            messaging,
        }
    }

    #[must_use]
    pub fn dispatch(&self, request: &DispatchRequest<'_>) -> DispatchReport {
        let layer = request.event.escalation_layer;
        let raw = request.event.risk_score;
        let mut notes = Vec::new();

        if layer == 0 {
            return DispatchReport {
                direct_contact: DirectContactResult::NotAttempted,
                circle: CircleResult::NotRequired,
                notes,
            };
        }

        let severe = requires_circle_notification(layer, raw);

        // Severe signals skip straight to the circle unless policy says the
        // monitored person must always be attempted first.
        let attempt_direct = if severe {
            request.ai_first_contact
        } else {
            true
        };

        let direct_contact = if attempt_direct {
            self.attempt_direct_contact(request, &mut notes)
        } else {
            notes.push("direct contact skipped: severe signal routed to circle".to_string());
            DirectContactResult::NotAttempted
        };

        let circle_required = severe || layer >= 3;
        let circle = if !circle_required {
            if layer == 2 {
                // Tier 2 records intent only: any further escalation arrives
                // as a new, higher-severity signal.
                notes.push(
                    "tier 2: will ask permission before contacting trusted circle".to_string(),
                );
            }
            CircleResult::NotRequired
        } else if request.at_cap {
            notes.push("weekly outreach cap reached: circle notification withheld".to_string());
            CircleResult::BlockedByCap
        } else {
            self.notify_circle(request, &mut notes)
        };

        DispatchReport {
            direct_contact,
            circle,
            notes,
        }
    }

    fn attempt_direct_contact(
        &self,
        request: &DispatchRequest<'_>,
        notes: &mut Vec<String>,
    ) -> DirectContactResult {
        let script =
            direct_contact_script(request.event.category, &request.person.display_name);
        match self.telephony.place_advisory_call(
            &request.person.phone_number,
            request.person.person_id,
            &script,
        ) {
            Ok(()) => {
                info!(
                    person_id = %request.person.person_id,
                    event_id = %request.event.event_id,
                    "advisory call placed"
                );
                notes.push("advisory call placed to monitored person".to_string());
                DirectContactResult::Succeeded
            }
            Err(err) => {
                warn!(
                    person_id = %request.person.person_id,
                    event_id = %request.event.event_id,
                    error = %err,
                    "advisory call failed"
                );
                notes.push(format!("advisory call failed: {err}"));
                DirectContactResult::Failed(err.to_string())
            }
        }
    }

    fn notify_circle(
        &self,
        request: &DispatchRequest<'_>,
        notes: &mut Vec<String>,
    ) -> CircleResult {
        let mut eligible: Vec<&TrustedContact> = request
            .contacts
            .iter()
            .filter(|contact| contact.eligible_for(request.event.category))
            .collect();
        eligible.sort_by_key(|contact| (contact.priority_order, contact.inserted_seq));

        let Some(contact) = eligible.first() else {
            warn!(
                person_id = %request.person.person_id,
                event_id = %request.event.event_id,
                category = request.event.category.as_str(),
                "no eligible trusted contact"
            );
            notes.push("no eligible trusted contact for this category".to_string());
            return CircleResult::NoEligibleContact;
        };

        let mut failures = Vec::new();
        for &channel in &contact.outreach_methods {
            let body = circle_alert_message(
                request.event.category,
                channel,
                &request.person.display_name,
                request.event.risk_score,
            );
            match self
                .messaging
                .send_message(channel, &contact.phone_number, &body)
            {
                Ok(()) => {
                    info!(
                        person_id = %request.person.person_id,
                        event_id = %request.event.event_id,
                        contact_id = %contact.contact_id,
                        channel = channel.as_str(),
                        "trusted circle notified"
                    );
                    notes.push(format!(
                        "notified trusted contact {} via {}",
                        contact.name,
                        channel.as_str()
                    ));
                    return CircleResult::Notified {
                        contact_id: contact.contact_id,
                        channel,
                    };
                }
                Err(err) => {
                    warn!(
                        contact_id = %contact.contact_id,
                        channel = channel.as_str(),
                        error = %err,
                        "circle notification channel failed"
                    );
                    failures.push(format!("{}: {err}", channel.as_str()));
                }
            }
        }

        let summary = if failures.is_empty() {
            "contact has no outreach methods".to_string()
        } else {
            format!("all channels failed ({})", failures.join(", "))
        };
        notes.push(format!("circle notification failed: {summary}"));
        CircleResult::Failed(summary)
    }
}
