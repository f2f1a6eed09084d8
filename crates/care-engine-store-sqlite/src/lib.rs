#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use care_engine_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, BehavioralBaseline, CareEvent, CareSettings,
    ContactId, EventId, EventOutcome, HistorySnapshot, MonitoredPerson, OutreachChannel, PersonId,
    ScamThreshold, Sensitivity, SignalCategory, TrustedContact, WellbeingSample,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::{Duration, OffsetDateTime};

const CARE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_CARE_V1: &str = r"
CREATE TABLE IF NOT EXISTS monitored_persons (
  person_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  phone_number TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS care_settings (
  person_id TEXT PRIMARY KEY REFERENCES monitored_persons(person_id),
  care_enabled INTEGER NOT NULL CHECK (care_enabled IN (0, 1)),
  ai_first_contact INTEGER NOT NULL CHECK (ai_first_contact IN (0, 1)),
  sensitivity TEXT NOT NULL CHECK (sensitivity IN ('conservative', 'balanced', 'protective')),
  silence_window_hours INTEGER NOT NULL CHECK (silence_window_hours >= 1),
  scam_threshold TEXT NOT NULL CHECK (scam_threshold IN ('low', 'medium', 'high')),
  max_outreach_per_week INTEGER NOT NULL CHECK (max_outreach_per_week >= 1),
  escalation_cooldown_hours INTEGER NOT NULL CHECK (escalation_cooldown_hours >= 0)
);

CREATE TABLE IF NOT EXISTS care_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  person_id TEXT NOT NULL REFERENCES monitored_persons(person_id),
  category TEXT NOT NULL CHECK (
    category IN (
      'cognitive_drift',
      'emotional',
      'scam',
      'silence',
      'medication',
      'help_request',
      'environmental'
    )
  ),
  risk_score INTEGER NOT NULL CHECK (risk_score BETWEEN 1 AND 10),
  escalation_layer INTEGER NOT NULL CHECK (escalation_layer BETWEEN 0 AND 4),
  description TEXT NOT NULL,
  ai_action TEXT NOT NULL,
  ai_contacted_elderly INTEGER NOT NULL DEFAULT 0 CHECK (ai_contacted_elderly IN (0, 1)),
  external_contact_id TEXT,
  external_contact_method TEXT CHECK (
    external_contact_method IN ('whatsapp', 'sms') OR external_contact_method IS NULL
  ),
  outcome TEXT NOT NULL DEFAULT 'pending' CHECK (
    outcome IN ('pending', 'resolved', 'false_alarm', 'escalated')
  ),
  created_at TEXT NOT NULL,
  created_at_unix INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_care_events_audit_immutable
BEFORE UPDATE ON care_events
WHEN NEW.event_id != OLD.event_id
  OR NEW.person_id != OLD.person_id
  OR NEW.category != OLD.category
  OR NEW.risk_score != OLD.risk_score
  OR NEW.escalation_layer != OLD.escalation_layer
  OR NEW.description != OLD.description
  OR NEW.created_at != OLD.created_at
  OR NEW.created_at_unix != OLD.created_at_unix
BEGIN
  SELECT RAISE(FAIL, 'care_events audit fields are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_care_events_contact_set_once
BEFORE UPDATE ON care_events
WHEN OLD.external_contact_id IS NOT NULL
 AND (NEW.external_contact_id IS NOT OLD.external_contact_id
   OR NEW.external_contact_method IS NOT OLD.external_contact_method)
BEGIN
  SELECT RAISE(FAIL, 'care_events contact fields are set once');
END;

CREATE TRIGGER IF NOT EXISTS trg_care_events_no_delete
BEFORE DELETE ON care_events
BEGIN
  SELECT RAISE(FAIL, 'care_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_care_events_person_seq
  ON care_events(person_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_care_events_person_created
  ON care_events(person_id, created_at_unix);
CREATE INDEX IF NOT EXISTS idx_care_events_person_layer_created
  ON care_events(person_id, escalation_layer, created_at_unix);

CREATE TABLE IF NOT EXISTS trusted_contacts (
  inserted_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  contact_id TEXT NOT NULL UNIQUE,
  person_id TEXT NOT NULL REFERENCES monitored_persons(person_id),
  name TEXT NOT NULL,
  priority_order INTEGER NOT NULL CHECK (priority_order >= 0),
  phone_number TEXT NOT NULL,
  outreach_methods TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  notify_scam INTEGER NOT NULL DEFAULT 1 CHECK (notify_scam IN (0, 1)),
  notify_emotional INTEGER NOT NULL DEFAULT 1 CHECK (notify_emotional IN (0, 1)),
  notify_silence INTEGER NOT NULL DEFAULT 1 CHECK (notify_silence IN (0, 1)),
  notify_cognitive INTEGER NOT NULL DEFAULT 1 CHECK (notify_cognitive IN (0, 1)),
  notify_routine INTEGER NOT NULL DEFAULT 1 CHECK (notify_routine IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_trusted_contacts_person_priority
  ON trusted_contacts(person_id, priority_order, inserted_seq);

CREATE TABLE IF NOT EXISTS behavioral_baselines (
  person_id TEXT PRIMARY KEY REFERENCES monitored_persons(person_id),
  avg_daily_conversations REAL NOT NULL,
  avg_mood_score REAL NOT NULL CHECK (avg_mood_score BETWEEN 0.0 AND 100.0),
  avg_conversation_minutes REAL NOT NULL,
  last_interaction TEXT,
  refreshed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wellbeing_logs (
  log_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  person_id TEXT NOT NULL REFERENCES monitored_persons(person_id),
  mood_score REAL NOT NULL CHECK (mood_score BETWEEN 0.0 AND 5.0),
  conversation_count INTEGER NOT NULL CHECK (conversation_count >= 0),
  conversation_minutes REAL NOT NULL CHECK (conversation_minutes >= 0.0),
  logged_at TEXT NOT NULL,
  logged_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wellbeing_logs_person_logged
  ON wellbeing_logs(person_id, logged_at_unix);

CREATE TABLE IF NOT EXISTS interaction_log (
  interaction_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  person_id TEXT NOT NULL REFERENCES monitored_persons(person_id),
  occurred_at TEXT NOT NULL,
  occurred_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interaction_log_person_occurred
  ON interaction_log(person_id, occurred_at_unix);
";

pub struct SqliteCareStore {
    conn: Connection,
}

impl SqliteCareStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CARE_V1)
            .context("failed to apply care schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CARE_MIGRATION_VERSION, now],
            )
            .context("failed to register care schema migration")?;

        Ok(())
    }

    pub fn insert_person(&self, person: &MonitoredPerson) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO monitored_persons(person_id, display_name, phone_number, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    person.person_id.to_string(),
                    person.display_name,
                    person.phone_number,
                    format_rfc3339(person.created_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to insert monitored person")?;
        Ok(())
    }

    pub fn get_person(&self, person_id: PersonId) -> Result<Option<MonitoredPerson>> {
        let mut stmt = self.conn.prepare(
            "SELECT person_id, display_name, phone_number, created_at
             FROM monitored_persons
             WHERE person_id = ?1",
        )?;

        let row = stmt
            .query_row(params![person_id.to_string()], parse_person_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_persons(&self) -> Result<Vec<MonitoredPerson>> {
        let mut stmt = self.conn.prepare(
            "SELECT person_id, display_name, phone_number, created_at
             FROM monitored_persons
             ORDER BY person_id ASC",
        )?;

        let rows = stmt.query_map([], parse_person_row)?;
        collect_rows(rows)
    }

    /// Returns the settings row, creating the defaults if none exists yet.
    /// Missing configuration is never an error.
    pub fn ensure_settings(&mut self, person_id: PersonId) -> Result<CareSettings> {
        if let Some(existing) = self.get_settings(person_id)? {
            return Ok(existing);
        }
        let defaults = CareSettings::defaults(person_id);
        self.upsert_settings(&defaults)?;
        Ok(defaults)
    }

    pub fn get_settings(&self, person_id: PersonId) -> Result<Option<CareSettings>> {
        let mut stmt = self.conn.prepare(
            "SELECT person_id, care_enabled, ai_first_contact, sensitivity,
                    silence_window_hours, scam_threshold, max_outreach_per_week,
                    escalation_cooldown_hours
             FROM care_settings
             WHERE person_id = ?1",
        )?;

        let row = stmt
            .query_row(params![person_id.to_string()], parse_settings_row)
            .optional()?;
        Ok(row)
    }

    /// Last-writer-wins upsert; settings changes are infrequent and
    /// human-driven, so no merge logic.
    pub fn upsert_settings(&mut self, settings: &CareSettings) -> Result<()> {
        settings
            .validate()
            .map_err(|err| anyhow!("invalid care settings: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO care_settings(
                    person_id, care_enabled, ai_first_contact, sensitivity,
                    silence_window_hours, scam_threshold, max_outreach_per_week,
                    escalation_cooldown_hours
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(person_id) DO UPDATE SET
                    care_enabled = excluded.care_enabled,
                    ai_first_contact = excluded.ai_first_contact,
                    sensitivity = excluded.sensitivity,
                    silence_window_hours = excluded.silence_window_hours,
                    scam_threshold = excluded.scam_threshold,
                    max_outreach_per_week = excluded.max_outreach_per_week,
                    escalation_cooldown_hours = excluded.escalation_cooldown_hours",
                params![
                    settings.person_id.to_string(),
                    bool_to_sql(settings.care_enabled),
                    bool_to_sql(settings.ai_first_contact),
                    settings.sensitivity.as_str(),
                    settings.silence_window_hours,
                    settings.scam_threshold.as_str(),
                    i64::from(settings.max_outreach_per_week),
                    settings.escalation_cooldown_hours,
                ],
            )
            .context("failed to upsert care settings")?;
        Ok(())
    }

    /// Appends one audit row. The row is durable before any dispatch side
    /// effect may run.
    pub fn append_event(&mut self, event: &CareEvent) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;

        tx.execute(
            "INSERT INTO care_events(
                event_id, person_id, category, risk_score, escalation_layer,
                description, ai_action, ai_contacted_elderly,
                external_contact_id, external_contact_method, outcome,
                created_at, created_at_unix
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8,
                ?9, ?10, ?11,
                ?12, ?13
             )",
            params![
                event.event_id.to_string(),
                event.person_id.to_string(),
                event.category.as_str(),
                i64::from(event.risk_score),
                i64::from(event.escalation_layer),
                event.description,
                event.ai_action,
                bool_to_sql(event.ai_contacted_elderly),
                event.external_contact_id.map(|id| id.to_string()),
                event.external_contact_method.map(OutreachChannel::as_str),
                event.outcome.as_str(),
                format_rfc3339(event.created_at).map_err(|err| anyhow!(err.to_string()))?,
                event.created_at.unix_timestamp(),
            ],
        )
        .context("failed to append care event")?;

        tx.commit().context("failed to commit event transaction")?;
        Ok(())
    }

    pub fn get_event(&self, event_id: EventId) -> Result<Option<CareEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, person_id, category, risk_score, escalation_layer,
                    description, ai_action, ai_contacted_elderly,
                    external_contact_id, external_contact_method, outcome, created_at
             FROM care_events
             WHERE event_id = ?1",
        )?;

        let row = stmt
            .query_row(params![event_id.to_string()], parse_event_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_events_for_person(
        &self,
        person_id: PersonId,
        limit: Option<usize>,
    ) -> Result<Vec<CareEvent>> {
        let mut query = "SELECT event_id, person_id, category, risk_score, escalation_layer,
                    description, ai_action, ai_contacted_elderly,
                    external_contact_id, external_contact_method, outcome, created_at
             FROM care_events
             WHERE person_id = ?1
             ORDER BY event_seq DESC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![person_id.to_string()], parse_event_row)?;
        collect_rows(rows)
    }

    /// Marks the direct-contact attempt on an existing event and appends
    /// the dispatch note to the audit rationale.
    pub fn mark_person_contacted(&mut self, event_id: EventId, note: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE care_events
                 SET ai_contacted_elderly = 1,
                     ai_action = ai_action || '; ' || ?2
                 WHERE event_id = ?1",
                params![event_id.to_string(), note],
            )
            .context("failed to mark person contacted")?;
        if changed == 0 {
            return Err(anyhow!("no care event with id {event_id}"));
        }
        Ok(())
    }

    /// Appends a dispatch note (e.g. a collaborator failure) to the audit
    /// rationale without touching any other field.
    pub fn append_dispatch_note(&mut self, event_id: EventId, note: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE care_events
                 SET ai_action = ai_action || '; ' || ?2
                 WHERE event_id = ?1",
                params![event_id.to_string(), note],
            )
            .context("failed to append dispatch note")?;
        if changed == 0 {
            return Err(anyhow!("no care event with id {event_id}"));
        }
        Ok(())
    }

    /// Records the single trusted-circle notification for an event. The
    /// contact fields are set once; the SQL trigger rejects overwrites.
    pub fn record_circle_notification(
        &mut self,
        event_id: EventId,
        contact_id: ContactId,
        channel: OutreachChannel,
        note: &str,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE care_events
                 SET external_contact_id = ?2,
                     external_contact_method = ?3,
                     outcome = 'escalated',
                     ai_action = ai_action || '; ' || ?4
                 WHERE event_id = ?1",
                params![
                    event_id.to_string(),
                    contact_id.to_string(),
                    channel.as_str(),
                    note,
                ],
            )
            .context("failed to record circle notification")?;
        if changed == 0 {
            return Err(anyhow!("no care event with id {event_id}"));
        }
        Ok(())
    }

    /// Reviewer-side outcome update. Audit fields stay frozen.
    pub fn set_outcome(&mut self, event_id: EventId, outcome: EventOutcome) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE care_events SET outcome = ?2 WHERE event_id = ?1",
                params![event_id.to_string(), outcome.as_str()],
            )
            .context("failed to set event outcome")?;
        if changed == 0 {
            return Err(anyhow!("no care event with id {event_id}"));
        }
        Ok(())
    }

    /// All temporal-window counters the suppression rules need, read on the
    /// same connection that will append the new event (read-your-writes).
    pub fn history_snapshot(&self, person_id: PersonId, now: OffsetDateTime) -> Result<HistorySnapshot> {
        let person = person_id.to_string();
        let week_ago = (now - Duration::days(7)).unix_timestamp();
        let two_days_ago = (now - Duration::hours(48)).unix_timestamp();

        let last_actionable_at: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM care_events
                 WHERE person_id = ?1 AND escalation_layer >= 1
                 ORDER BY created_at_unix DESC, event_seq DESC LIMIT 1",
                params![person],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query last actionable event")?;

        let last_actionable_at = last_actionable_at
            .map(|raw| parse_rfc3339_utc(&raw).map_err(|err| anyhow!(err.to_string())))
            .transpose()?;

        let weekly_action_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM care_events
                 WHERE person_id = ?1 AND escalation_layer >= 2 AND created_at_unix >= ?2",
                params![person, week_ago],
                |row| row.get(0),
            )
            .context("failed to count weekly actions")?;

        let events_last_48h: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM care_events
                 WHERE person_id = ?1 AND created_at_unix >= ?2",
                params![person, two_days_ago],
                |row| row.get(0),
            )
            .context("failed to count 48h events")?;

        let false_alarms_last_7d: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM care_events
                 WHERE person_id = ?1 AND outcome = 'false_alarm' AND created_at_unix >= ?2",
                params![person, week_ago],
                |row| row.get(0),
            )
            .context("failed to count recent false alarms")?;

        Ok(HistorySnapshot {
            last_actionable_at,
            weekly_action_count: u32::try_from(weekly_action_count).unwrap_or(u32::MAX),
            events_last_48h: u32::try_from(events_last_48h).unwrap_or(u32::MAX),
            false_alarms_last_7d: u32::try_from(false_alarms_last_7d).unwrap_or(u32::MAX),
        })
    }

    pub fn insert_contact(&mut self, contact: &TrustedContact) -> Result<()> {
        let methods = serde_json::to_string(
            &contact
                .outreach_methods
                .iter()
                .map(|method| method.as_str())
                .collect::<Vec<_>>(),
        )
        .context("failed to serialize outreach methods")?;

        self.conn
            .execute(
                "INSERT INTO trusted_contacts(
                    contact_id, person_id, name, priority_order, phone_number,
                    outreach_methods, is_active, notify_scam, notify_emotional,
                    notify_silence, notify_cognitive, notify_routine
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    contact.contact_id.to_string(),
                    contact.person_id.to_string(),
                    contact.name,
                    i64::from(contact.priority_order),
                    contact.phone_number,
                    methods,
                    bool_to_sql(contact.is_active),
                    bool_to_sql(contact.notify_scam),
                    bool_to_sql(contact.notify_emotional),
                    bool_to_sql(contact.notify_silence),
                    bool_to_sql(contact.notify_cognitive),
                    bool_to_sql(contact.notify_routine),
                ],
            )
            .context("failed to insert trusted contact")?;
        Ok(())
    }

    /// Contacts ordered for dispatch: priority ascending, insertion order
    /// breaking ties. Includes inactive rows; eligibility filtering is the
    /// dispatcher's concern.
    pub fn list_contacts(&self, person_id: PersonId) -> Result<Vec<TrustedContact>> {
        let mut stmt = self.conn.prepare(
            "SELECT contact_id, person_id, name, priority_order, inserted_seq,
                    phone_number, outreach_methods, is_active, notify_scam,
                    notify_emotional, notify_silence, notify_cognitive, notify_routine
             FROM trusted_contacts
             WHERE person_id = ?1
             ORDER BY priority_order ASC, inserted_seq ASC",
        )?;

        let rows = stmt.query_map(params![person_id.to_string()], parse_contact_row)?;
        collect_rows(rows)
    }

    pub fn upsert_baseline(&mut self, baseline: &BehavioralBaseline) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO behavioral_baselines(
                    person_id, avg_daily_conversations, avg_mood_score,
                    avg_conversation_minutes, last_interaction, refreshed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(person_id) DO UPDATE SET
                    avg_daily_conversations = excluded.avg_daily_conversations,
                    avg_mood_score = excluded.avg_mood_score,
                    avg_conversation_minutes = excluded.avg_conversation_minutes,
                    last_interaction = excluded.last_interaction,
                    refreshed_at = excluded.refreshed_at",
                params![
                    baseline.person_id.to_string(),
                    baseline.avg_daily_conversations,
                    baseline.avg_mood_score,
                    baseline.avg_conversation_minutes,
                    baseline
                        .last_interaction
                        .map(format_rfc3339)
                        .transpose()
                        .map_err(|err| anyhow!(err.to_string()))?,
                    format_rfc3339(baseline.refreshed_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to upsert behavioral baseline")?;
        Ok(())
    }

    pub fn get_baseline(&self, person_id: PersonId) -> Result<Option<BehavioralBaseline>> {
        let mut stmt = self.conn.prepare(
            "SELECT person_id, avg_daily_conversations, avg_mood_score,
                    avg_conversation_minutes, last_interaction, refreshed_at
             FROM behavioral_baselines
             WHERE person_id = ?1",
        )?;

        let row = stmt
            .query_row(params![person_id.to_string()], parse_baseline_row)
            .optional()?;
        Ok(row)
    }

    pub fn insert_wellbeing_log(
        &mut self,
        person_id: PersonId,
        sample: &WellbeingSample,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO wellbeing_logs(
                    person_id, mood_score, conversation_count, conversation_minutes,
                    logged_at, logged_at_unix
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    person_id.to_string(),
                    sample.mood_score,
                    i64::from(sample.conversation_count),
                    sample.conversation_minutes,
                    format_rfc3339(sample.logged_at).map_err(|err| anyhow!(err.to_string()))?,
                    sample.logged_at.unix_timestamp(),
                ],
            )
            .context("failed to insert wellbeing log")?;
        Ok(())
    }

    pub fn wellbeing_samples_since(
        &self,
        person_id: PersonId,
        since: OffsetDateTime,
    ) -> Result<Vec<WellbeingSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT mood_score, conversation_count, conversation_minutes, logged_at
             FROM wellbeing_logs
             WHERE person_id = ?1 AND logged_at_unix >= ?2
             ORDER BY log_seq ASC",
        )?;

        let rows = stmt.query_map(
            params![person_id.to_string(), since.unix_timestamp()],
            |row| {
                let mood_score: f64 = row.get(0)?;
                let conversation_count_i64: i64 = row.get(1)?;
                let conversation_minutes: f64 = row.get(2)?;
                let logged_at_raw: String = row.get(3)?;
                Ok(WellbeingSample {
                    mood_score,
                    conversation_count: u32::try_from(conversation_count_i64).map_err(|_| {
                        invalid_column(1, format!("invalid conversation_count: {conversation_count_i64}"))
                    })?,
                    conversation_minutes,
                    logged_at: parse_timestamp_column(3, &logged_at_raw)?,
                })
            },
        )?;
        collect_rows(rows)
    }

    pub fn record_interaction(
        &mut self,
        person_id: PersonId,
        occurred_at: OffsetDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO interaction_log(person_id, occurred_at, occurred_at_unix)
                 VALUES (?1, ?2, ?3)",
                params![
                    person_id.to_string(),
                    format_rfc3339(occurred_at).map_err(|err| anyhow!(err.to_string()))?,
                    occurred_at.unix_timestamp(),
                ],
            )
            .context("failed to record interaction")?;
        Ok(())
    }

    pub fn latest_interaction_at(&self, person_id: PersonId) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT occurred_at FROM interaction_log
                 WHERE person_id = ?1
                 ORDER BY occurred_at_unix DESC, interaction_seq DESC
                 LIMIT 1",
                params![person_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query latest interaction")?;

        raw.map(|value| parse_rfc3339_utc(&value).map_err(|err| anyhow!(err.to_string())))
            .transpose()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_timestamp_column(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| invalid_column(index, format!("invalid timestamp: {err}")))
}

fn parse_person_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MonitoredPerson> {
    let person_id_raw: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let phone_number: String = row.get(2)?;
    let created_at_raw: String = row.get(3)?;

    Ok(MonitoredPerson {
        person_id: PersonId::parse(&person_id_raw)
            .map_err(|err| invalid_column(0, err.to_string()))?,
        display_name,
        phone_number,
        created_at: parse_timestamp_column(3, &created_at_raw)?,
    })
}

fn parse_settings_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CareSettings> {
    let person_id_raw: String = row.get(0)?;
    let care_enabled: i64 = row.get(1)?;
    let ai_first_contact: i64 = row.get(2)?;
    let sensitivity_raw: String = row.get(3)?;
    let silence_window_hours: i64 = row.get(4)?;
    let scam_threshold_raw: String = row.get(5)?;
    let max_outreach_i64: i64 = row.get(6)?;
    let escalation_cooldown_hours: i64 = row.get(7)?;

    Ok(CareSettings {
        person_id: PersonId::parse(&person_id_raw)
            .map_err(|err| invalid_column(0, err.to_string()))?,
        care_enabled: sql_to_bool(care_enabled),
        ai_first_contact: sql_to_bool(ai_first_contact),
        sensitivity: Sensitivity::parse(&sensitivity_raw)
            .ok_or_else(|| invalid_column(3, format!("invalid sensitivity: {sensitivity_raw}")))?,
        silence_window_hours,
        scam_threshold: ScamThreshold::parse(&scam_threshold_raw).ok_or_else(|| {
            invalid_column(5, format!("invalid scam_threshold: {scam_threshold_raw}"))
        })?,
        max_outreach_per_week: u32::try_from(max_outreach_i64).map_err(|_| {
            invalid_column(6, format!("invalid max_outreach_per_week: {max_outreach_i64}"))
        })?,
        escalation_cooldown_hours,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CareEvent> {
    let event_id_raw: String = row.get(0)?;
    let person_id_raw: String = row.get(1)?;
    let category_raw: String = row.get(2)?;
    let risk_score_i64: i64 = row.get(3)?;
    let layer_i64: i64 = row.get(4)?;
    let description: String = row.get(5)?;
    let ai_action: String = row.get(6)?;
    let ai_contacted_elderly: i64 = row.get(7)?;
    let external_contact_id_raw: Option<String> = row.get(8)?;
    let external_contact_method_raw: Option<String> = row.get(9)?;
    let outcome_raw: String = row.get(10)?;
    let created_at_raw: String = row.get(11)?;

    let external_contact_id = external_contact_id_raw
        .map(|raw| ContactId::parse(&raw).map_err(|err| invalid_column(8, err.to_string())))
        .transpose()?;
    let external_contact_method = external_contact_method_raw
        .map(|raw| {
            OutreachChannel::parse(&raw)
                .ok_or_else(|| invalid_column(9, format!("invalid contact method: {raw}")))
        })
        .transpose()?;

    Ok(CareEvent {
        event_id: EventId::parse(&event_id_raw).map_err(|err| invalid_column(0, err.to_string()))?,
        person_id: PersonId::parse(&person_id_raw)
            .map_err(|err| invalid_column(1, err.to_string()))?,
        category: SignalCategory::parse(&category_raw)
            .ok_or_else(|| invalid_column(2, format!("invalid category: {category_raw}")))?,
        risk_score: u8::try_from(risk_score_i64)
            .map_err(|_| invalid_column(3, format!("invalid risk_score: {risk_score_i64}")))?,
        escalation_layer: u8::try_from(layer_i64)
            .map_err(|_| invalid_column(4, format!("invalid escalation_layer: {layer_i64}")))?,
        description,
        ai_action,
        ai_contacted_elderly: sql_to_bool(ai_contacted_elderly),
        external_contact_id,
        external_contact_method,
        outcome: EventOutcome::parse(&outcome_raw)
            .ok_or_else(|| invalid_column(10, format!("invalid outcome: {outcome_raw}")))?,
        created_at: parse_timestamp_column(11, &created_at_raw)?,
    })
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrustedContact> {
    let contact_id_raw: String = row.get(0)?;
    let person_id_raw: String = row.get(1)?;
    let name: String = row.get(2)?;
    let priority_i64: i64 = row.get(3)?;
    let inserted_seq: i64 = row.get(4)?;
    let phone_number: String = row.get(5)?;
    let methods_raw: String = row.get(6)?;
    let is_active: i64 = row.get(7)?;
    let notify_scam: i64 = row.get(8)?;
    let notify_emotional: i64 = row.get(9)?;
    let notify_silence: i64 = row.get(10)?;
    let notify_cognitive: i64 = row.get(11)?;
    let notify_routine: i64 = row.get(12)?;

    let method_names: Vec<String> = serde_json::from_str(&methods_raw)
        .map_err(|err| invalid_column(6, format!("invalid outreach_methods JSON: {err}")))?;
    let mut outreach_methods = Vec::with_capacity(method_names.len());
    for raw in &method_names {
        let channel = OutreachChannel::parse(raw)
            .ok_or_else(|| invalid_column(6, format!("invalid outreach channel: {raw}")))?;
        outreach_methods.push(channel);
    }

    Ok(TrustedContact {
        contact_id: ContactId::parse(&contact_id_raw)
            .map_err(|err| invalid_column(0, err.to_string()))?,
        person_id: PersonId::parse(&person_id_raw)
            .map_err(|err| invalid_column(1, err.to_string()))?,
        name,
        priority_order: u32::try_from(priority_i64)
            .map_err(|_| invalid_column(3, format!("invalid priority_order: {priority_i64}")))?,
        inserted_seq,
        phone_number,
        outreach_methods,
        is_active: sql_to_bool(is_active),
        notify_scam: sql_to_bool(notify_scam),
        notify_emotional: sql_to_bool(notify_emotional),
        notify_silence: sql_to_bool(notify_silence),
        notify_cognitive: sql_to_bool(notify_cognitive),
        notify_routine: sql_to_bool(notify_routine),
    })
}

fn parse_baseline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BehavioralBaseline> {
    let person_id_raw: String = row.get(0)?;
    let avg_daily_conversations: f64 = row.get(1)?;
    let avg_mood_score: f64 = row.get(2)?;
    let avg_conversation_minutes: f64 = row.get(3)?;
    let last_interaction_raw: Option<String> = row.get(4)?;
    let refreshed_at_raw: String = row.get(5)?;

    let last_interaction = last_interaction_raw
        .map(|raw| parse_timestamp_column(4, &raw))
        .transpose()?;

    Ok(BehavioralBaseline {
        person_id: PersonId::parse(&person_id_raw)
            .map_err(|err| invalid_column(0, err.to_string()))?,
        avg_daily_conversations,
        avg_mood_score,
        avg_conversation_minutes,
        last_interaction,
        refreshed_at: parse_timestamp_column(5, &refreshed_at_raw)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to read sqlite row")?);
    }
    Ok(out)
}
