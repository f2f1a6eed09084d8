#![allow(clippy::missing_errors_doc)]

use anyhow::{anyhow, Context, Result};
use care_engine_core::{
    compute_baseline, decide_escalation, hours_between, silence_raw_risk, CareEvent, CareSettings,
    CareSignal, EscalationDecision, EventId, EventOutcome, MonitoredPerson, PersonId,
    SignalCategory,
};
use care_engine_dispatch::{
    CircleResult, ContactDispatcher, DirectContactResult, DispatchReport, DispatchRequest,
    MessagingGateway, TelephonyDispatch,
};
use care_engine_store_sqlite::SqliteCareStore;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Result of one `submit_signal` call: the durable event row plus the
/// decision that produced it. `dispatch` is `None` for layer-0 events.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub event: CareEvent,
    pub decision: EscalationDecision,
    pub dispatch: Option<DispatchReport>,
}

#[derive(Debug, Clone, Default)]
pub struct SilenceTickReport {
    pub persons_checked: usize,
    pub signals_raised: Vec<EventId>,
    pub errors: Vec<(PersonId, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct BaselineTickReport {
    pub persons_refreshed: usize,
    pub errors: Vec<(PersonId, String)>,
}

/// Ties the store, the decision rules, and the outreach collaborators
/// together. All writes go through one store borrow, so same-person
/// evaluations serialize at the datastore.
pub struct CareOrchestrator<'a> {
    store: &'a mut SqliteCareStore,
    telephony: &'a dyn TelephonyDispatch,
    messaging: &'a dyn MessagingGateway,
}

impl<'a> CareOrchestrator<'a> {
    pub fn new(
        store: &'a mut SqliteCareStore,
        telephony: &'a dyn TelephonyDispatch,
        messaging: &'a dyn MessagingGateway,
    ) -> Self {
        Self {
            store,
            telephony,
            messaging,
        }
    }

    /// Evaluates one wellbeing signal end to end: settings lookup, history
    /// read, escalation decision, durable event append, then dispatch.
    ///
    /// The submission succeeds once the event row is committed; dispatch
    /// failures are recorded on the event's audit trail instead of being
    /// surfaced as errors.
    pub fn submit_signal(
        &mut self,
        signal: &CareSignal,
        now: OffsetDateTime,
    ) -> Result<SubmitOutcome> {
        let person = self
            .store
            .get_person(signal.person_id)?
            .ok_or_else(|| anyhow!("unknown person {}", signal.person_id))?;

        let settings = self.store.ensure_settings(signal.person_id)?;
        let history = self
            .store
            .history_snapshot(signal.person_id, now)
            .context("failed to read escalation history")?;

        let decision = decide_escalation(signal, &settings, &history, now);

        // The producer's rationale rides along on the audit row.
        let ai_action = match &signal.rationale {
            Some(rationale) => format!("{}; reported rationale: {rationale}", decision.rationale),
            None => decision.rationale.clone(),
        };

        let event = CareEvent {
            event_id: EventId::new(),
            person_id: signal.person_id,
            category: signal.category,
            risk_score: signal.raw_risk,
            escalation_layer: decision.layer,
            description: signal.description.clone(),
            ai_action,
            ai_contacted_elderly: false,
            external_contact_id: None,
            external_contact_method: None,
            outcome: EventOutcome::Pending,
            created_at: now,
        };
        self.store
            .append_event(&event)
            .context("failed to persist care event")?;

        info!(
            person_id = %signal.person_id,
            event_id = %event.event_id,
            category = signal.category.as_str(),
            raw_risk = signal.raw_risk,
            layer = decision.layer,
            "signal evaluated"
        );

        if decision.layer == 0 {
            return Ok(SubmitOutcome {
                event,
                decision,
                dispatch: None,
            });
        }

        let dispatch = match self.dispatch_for_event(&event, &person, &settings, &decision) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(
                    event_id = %event.event_id,
                    error = %err,
                    "dispatch stage failed after event commit"
                );
                let note = format!("dispatch failed: {err}");
                if let Err(note_err) = self.store.append_dispatch_note(event.event_id, &note) {
                    warn!(event_id = %event.event_id, error = %note_err, "audit note write failed");
                }
                None
            }
        };

        let event = self.store.get_event(event.event_id)?.unwrap_or(event);
        Ok(SubmitOutcome {
            event,
            decision,
            dispatch,
        })
    }

    fn dispatch_for_event(
        &mut self,
        event: &CareEvent,
        person: &MonitoredPerson,
        settings: &CareSettings,
        decision: &EscalationDecision,
    ) -> Result<DispatchReport> {
        let contacts = self.store.list_contacts(event.person_id)?;

        let report = ContactDispatcher::new(self.telephony, self.messaging).dispatch(
            &DispatchRequest {
                event,
                person,
                contacts: &contacts,
                ai_first_contact: settings.ai_first_contact,
                at_cap: decision.at_cap,
            },
        );

        match &report.direct_contact {
            DirectContactResult::Succeeded => {
                self.store
                    .mark_person_contacted(event.event_id, "advisory call placed")?;
            }
            DirectContactResult::Failed(err) => {
                self.store
                    .append_dispatch_note(event.event_id, &format!("advisory call failed: {err}"))?;
            }
            DirectContactResult::NotAttempted => {}
        }

        match &report.circle {
            CircleResult::Notified {
                contact_id,
                channel,
            } => {
                self.store.record_circle_notification(
                    event.event_id,
                    *contact_id,
                    *channel,
                    "trusted circle notified",
                )?;
            }
            CircleResult::BlockedByCap => {
                self.store.append_dispatch_note(
                    event.event_id,
                    "weekly outreach cap reached; circle notification withheld",
                )?;
            }
            CircleResult::NoEligibleContact => {
                self.store.append_dispatch_note(
                    event.event_id,
                    "no eligible trusted contact for this category",
                )?;
            }
            CircleResult::Failed(summary) => {
                self.store.append_dispatch_note(
                    event.event_id,
                    &format!("circle notification failed: {summary}"),
                )?;
            }
            CircleResult::NotRequired => {}
        }

        Ok(report)
    }

    /// Scans every enrolled person and synthesizes a `silence` signal when
    /// the gap since their last interaction exceeds the configured window.
    /// Safe to re-run: the evaluator's cooldown absorbs repeated ticks.
    pub fn run_silence_tick(&mut self, now: OffsetDateTime) -> Result<SilenceTickReport> {
        let persons = self.store.list_persons()?;
        let mut report = SilenceTickReport::default();

        for person in persons {
            report.persons_checked += 1;
            match self.silence_check(person.person_id, now) {
                Ok(Some(event_id)) => report.signals_raised.push(event_id),
                Ok(None) => {}
                Err(err) => {
                    warn!(person_id = %person.person_id, error = %err, "silence check failed");
                    report.errors.push((person.person_id, err.to_string()));
                }
            }
        }

        Ok(report)
    }

    fn silence_check(
        &mut self,
        person_id: PersonId,
        now: OffsetDateTime,
    ) -> Result<Option<EventId>> {
        let settings = self.store.ensure_settings(person_id)?;
        if !settings.care_enabled {
            return Ok(None);
        }

        // No baseline yet means enrollment is too fresh to judge silence.
        let Some(baseline) = self.store.get_baseline(person_id)? else {
            return Ok(None);
        };
        let last_interaction = match self.store.latest_interaction_at(person_id)? {
            Some(at) => Some(at),
            None => baseline.last_interaction,
        };
        let Some(last_interaction) = last_interaction else {
            return Ok(None);
        };

        let hours_since = hours_between(last_interaction, now);
        #[allow(clippy::cast_precision_loss)]
        if hours_since <= settings.silence_window_hours as f64 {
            return Ok(None);
        }

        let raw = silence_raw_risk(hours_since, settings.silence_window_hours);
        let signal = CareSignal::new(
            person_id,
            SignalCategory::Silence,
            i64::from(raw),
            format!("no interaction for {hours_since:.0} hours"),
        );
        let outcome = self.submit_signal(&signal, now)?;
        Ok(Some(outcome.event.event_id))
    }

    /// Recomputes every person's behavioral baseline from the trailing 30
    /// days of wellbeing logs. Per-person failures are logged and do not
    /// stop the batch.
    pub fn run_baseline_tick(&mut self, now: OffsetDateTime) -> Result<BaselineTickReport> {
        let persons = self.store.list_persons()?;
        let mut report = BaselineTickReport::default();

        for person in persons {
            match self.refresh_baseline(person.person_id, now) {
                Ok(()) => report.persons_refreshed += 1,
                Err(err) => {
                    warn!(person_id = %person.person_id, error = %err, "baseline refresh failed");
                    report.errors.push((person.person_id, err.to_string()));
                }
            }
        }

        Ok(report)
    }

    fn refresh_baseline(&mut self, person_id: PersonId, now: OffsetDateTime) -> Result<()> {
        let since = now - Duration::days(30);
        let samples = self.store.wellbeing_samples_since(person_id, since)?;
        let last_interaction = self.store.latest_interaction_at(person_id)?;
        let baseline = compute_baseline(person_id, &samples, last_interaction, now);
        self.store.upsert_baseline(&baseline)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Silence,
    Baseline,
}

/// Explicit next-fire instants per monitor. Ticks run sequentially on one
/// loop, so a slow tick delays the next instead of overlapping it.
#[derive(Debug, Clone)]
pub struct MonitorSchedule {
    silence_every: Duration,
    baseline_every: Duration,
    next_silence: OffsetDateTime,
    next_baseline: OffsetDateTime,
}

impl MonitorSchedule {
    #[must_use]
    pub fn new(now: OffsetDateTime, silence_every: Duration, baseline_every: Duration) -> Self {
        Self {
            silence_every,
            baseline_every,
            next_silence: now + silence_every,
            next_baseline: now + baseline_every,
        }
    }

    /// Production cadence: silence hourly, baseline daily.
    #[must_use]
    pub fn hourly_daily(now: OffsetDateTime) -> Self {
        Self::new(now, Duration::hours(1), Duration::days(1))
    }

    #[must_use]
    pub fn next_fire(&self) -> OffsetDateTime {
        self.next_silence.min(self.next_baseline)
    }

    /// Returns the monitors due at `now` and advances their next-fire
    /// instants past it. A long stall fires each monitor once, not once
    /// per missed period.
    pub fn due(&mut self, now: OffsetDateTime) -> Vec<MonitorKind> {
        let mut fired = Vec::new();
        if now >= self.next_silence {
            fired.push(MonitorKind::Silence);
            while self.next_silence <= now {
                self.next_silence += self.silence_every;
            }
        }
        if now >= self.next_baseline {
            fired.push(MonitorKind::Baseline);
            while self.next_baseline <= now {
                self.next_baseline += self.baseline_every;
            }
        }
        fired
    }
}

/// Blocking monitor loop: sleeps to the next fire instant, runs the due
/// ticks, repeats. `max_rounds` bounds the loop for operator runs and
/// tests; `None` runs until the process is stopped.
pub fn run_monitors(
    orchestrator: &mut CareOrchestrator<'_>,
    schedule: &mut MonitorSchedule,
    max_rounds: Option<u64>,
) -> Result<()> {
    let mut rounds = 0_u64;
    loop {
        if let Some(max) = max_rounds {
            if rounds >= max {
                return Ok(());
            }
        }

        let now = care_engine_core::now_utc();
        let wait = schedule.next_fire() - now;
        if wait.is_positive() {
            std::thread::sleep(std::time::Duration::try_from(wait).unwrap_or_default());
        }

        let now = care_engine_core::now_utc();
        for kind in schedule.due(now) {
            match kind {
                MonitorKind::Silence => {
                    let tick = orchestrator.run_silence_tick(now)?;
                    info!(
                        checked = tick.persons_checked,
                        raised = tick.signals_raised.len(),
                        errors = tick.errors.len(),
                        "silence tick complete"
                    );
                }
                MonitorKind::Baseline => {
                    let tick = orchestrator.run_baseline_tick(now)?;
                    info!(
                        refreshed = tick.persons_refreshed,
                        errors = tick.errors.len(),
                        "baseline tick complete"
                    );
                }
            }
        }
        rounds += 1;
    }
}
