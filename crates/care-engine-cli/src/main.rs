use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use care_engine_core::{
    now_utc, parse_rfc3339_utc, CareSettings, CareSignal, ContactId, EventId, EventOutcome,
    MonitoredPerson, OutreachChannel, PersonId, ScamThreshold, Sensitivity, SignalCategory,
    TrustedContact, WellbeingSample,
};
use care_engine_dispatch::{
    DryRunMessaging, DryRunTelephony, HttpChannelConfig, HttpMessaging, HttpTelephony,
    MessagingGateway, TelephonyDispatch,
};
use care_engine_orchestrator::{run_monitors, CareOrchestrator, MonitorSchedule};
use care_engine_store_sqlite::SqliteCareStore;
use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "care-engine")]
#[command(about = "Care escalation engine with SQLite-backed audit events")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enroll and list monitored persons.
    Person(PersonArgs),
    /// Per-person care settings.
    Settings(SettingsArgs),
    /// Trusted-circle contacts.
    Contact(ContactArgs),
    /// Submit a wellbeing signal for evaluation.
    Signal(SignalArgs),
    /// Inspect the append-only event history.
    Events(EventsArgs),
    /// Reviewer verdict on a past event.
    Outcome(OutcomeArgs),
    /// Append a wellbeing log row for the baseline updater.
    Wellbeing(WellbeingArgs),
    /// Record that the person interacted with the assistant.
    Interaction(InteractionArgs),
    /// Run the periodic monitors.
    Monitor(MonitorArgs),
}

#[derive(Debug, Args)]
struct PersonArgs {
    #[command(subcommand)]
    command: PersonSubcommand,
}

#[derive(Debug, Subcommand)]
enum PersonSubcommand {
    Add {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
    },
    List {
        #[arg(long)]
        db: PathBuf,
    },
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[command(subcommand)]
    command: SettingsSubcommand,
}

#[derive(Debug, Subcommand)]
enum SettingsSubcommand {
    Show {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        person: String,
    },
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
struct SettingsSetArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    person: String,
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    ai_first_contact: Option<bool>,
    #[arg(long)]
    sensitivity: Option<String>,
    #[arg(long)]
    silence_window_hours: Option<i64>,
    #[arg(long)]
    scam_threshold: Option<String>,
    #[arg(long)]
    max_outreach_per_week: Option<u32>,
    #[arg(long)]
    cooldown_hours: Option<i64>,
}

#[derive(Debug, Args)]
struct ContactArgs {
    #[command(subcommand)]
    command: ContactSubcommand,
}

#[derive(Debug, Subcommand)]
enum ContactSubcommand {
    Add(ContactAddArgs),
    List {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        person: String,
    },
}

#[derive(Debug, Args)]
struct ContactAddArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    person: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    phone: String,
    #[arg(long, default_value_t = 1)]
    priority: u32,
    /// Comma-separated channels in fallback order, e.g. "whatsapp,sms".
    #[arg(long, default_value = "whatsapp,sms")]
    methods: String,
    /// Comma-separated concern families this contact wants to hear about.
    #[arg(long, default_value = "scam,emotional,silence,cognitive,routine")]
    notify: String,
    #[arg(long, default_value_t = false)]
    inactive: bool,
}

#[derive(Debug, Args)]
struct SignalArgs {
    #[command(subcommand)]
    command: SignalSubcommand,
}

#[derive(Debug, Subcommand)]
enum SignalSubcommand {
    Submit(SignalSubmitArgs),
}

#[derive(Debug, Args)]
struct SignalSubmitArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    person: String,
    #[arg(long)]
    category: String,
    #[arg(long)]
    risk: i64,
    #[arg(long)]
    description: String,
    #[arg(long)]
    rationale: Option<String>,
    #[arg(long)]
    telephony_config: Option<PathBuf>,
    #[arg(long)]
    messaging_config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EventsArgs {
    #[command(subcommand)]
    command: EventsSubcommand,
}

#[derive(Debug, Subcommand)]
enum EventsSubcommand {
    List {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        person: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Args)]
struct OutcomeArgs {
    #[command(subcommand)]
    command: OutcomeSubcommand,
}

#[derive(Debug, Subcommand)]
enum OutcomeSubcommand {
    Set {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        event: String,
        #[arg(long)]
        outcome: String,
    },
}

#[derive(Debug, Args)]
struct WellbeingArgs {
    #[command(subcommand)]
    command: WellbeingSubcommand,
}

#[derive(Debug, Subcommand)]
enum WellbeingSubcommand {
    Log(WellbeingLogArgs),
}

#[derive(Debug, Args)]
struct WellbeingLogArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    person: String,
    /// Mood on the 0-5 scale used by the wellbeing feed.
    #[arg(long)]
    mood: f64,
    #[arg(long)]
    conversations: u32,
    #[arg(long)]
    minutes: f64,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct InteractionArgs {
    #[command(subcommand)]
    command: InteractionSubcommand,
}

#[derive(Debug, Subcommand)]
enum InteractionSubcommand {
    Record {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        person: String,
        #[arg(long)]
        at: Option<String>,
    },
}

#[derive(Debug, Args)]
struct MonitorArgs {
    #[command(subcommand)]
    command: MonitorSubcommand,
}

#[derive(Debug, Subcommand)]
enum MonitorSubcommand {
    /// One silence sweep over all enrolled persons.
    Silence(MonitorTickArgs),
    /// One baseline refresh over all enrolled persons.
    Baseline(MonitorTickArgs),
    /// Blocking scheduler loop (silence hourly, baseline daily).
    Run(MonitorRunArgs),
}

#[derive(Debug, Args)]
struct MonitorTickArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    telephony_config: Option<PathBuf>,
    #[arg(long)]
    messaging_config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MonitorRunArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    telephony_config: Option<PathBuf>,
    #[arg(long)]
    messaging_config: Option<PathBuf>,
    /// Stop after this many scheduler rounds; omit to run until killed.
    #[arg(long)]
    rounds: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Person(args) => person_command(args),
        Commands::Settings(args) => settings_command(args),
        Commands::Contact(args) => contact_command(args),
        Commands::Signal(args) => signal_command(args),
        Commands::Events(args) => events_command(args),
        Commands::Outcome(args) => outcome_command(args),
        Commands::Wellbeing(args) => wellbeing_command(args),
        Commands::Interaction(args) => interaction_command(args),
        Commands::Monitor(args) => monitor_command(args),
    }
}

fn person_command(args: PersonArgs) -> Result<()> {
    match args.command {
        PersonSubcommand::Add { db, name, phone } => {
            let store = open_store(&db)?;
            let person = MonitoredPerson {
                person_id: PersonId::new(),
                display_name: name,
                phone_number: phone,
                created_at: now_utc(),
            };
            store.insert_person(&person)?;
            println!("person_id={} name={}", person.person_id, person.display_name);
        }
        PersonSubcommand::List { db } => {
            let store = open_store(&db)?;
            for person in store.list_persons()? {
                println!("{}", serde_json::to_string(&person)?);
            }
        }
    }
    Ok(())
}

fn settings_command(args: SettingsArgs) -> Result<()> {
    match args.command {
        SettingsSubcommand::Show { db, person } => {
            let store = open_store(&db)?;
            let person_id = parse_person_id(&person)?;
            let settings = store
                .get_settings(person_id)?
                .unwrap_or_else(|| CareSettings::defaults(person_id));
            println!("{}", serde_json::to_string(&settings)?);
        }
        SettingsSubcommand::Set(set) => {
            let mut store = open_store(&set.db)?;
            let person_id = parse_person_id(&set.person)?;
            let mut settings = store.ensure_settings(person_id)?;

            if let Some(enabled) = set.enabled {
                settings.care_enabled = enabled;
            }
            if let Some(first) = set.ai_first_contact {
                settings.ai_first_contact = first;
            }
            if let Some(raw) = set.sensitivity.as_deref() {
                settings.sensitivity = Sensitivity::parse(raw).ok_or_else(|| {
                    anyhow!("invalid sensitivity '{raw}'; use conservative|balanced|protective")
                })?;
            }
            if let Some(hours) = set.silence_window_hours {
                settings.silence_window_hours = hours;
            }
            if let Some(raw) = set.scam_threshold.as_deref() {
                settings.scam_threshold = ScamThreshold::parse(raw)
                    .ok_or_else(|| anyhow!("invalid scam_threshold '{raw}'; use low|medium|high"))?;
            }
            if let Some(max) = set.max_outreach_per_week {
                settings.max_outreach_per_week = max;
            }
            if let Some(hours) = set.cooldown_hours {
                settings.escalation_cooldown_hours = hours;
            }

            store.upsert_settings(&settings)?;
            println!("{}", serde_json::to_string(&settings)?);
        }
    }
    Ok(())
}

fn contact_command(args: ContactArgs) -> Result<()> {
    match args.command {
        ContactSubcommand::Add(add) => {
            let mut store = open_store(&add.db)?;
            let person_id = parse_person_id(&add.person)?;
            let notify = parse_notify_families(&add.notify)?;

            let contact = TrustedContact {
                contact_id: ContactId::new(),
                person_id,
                name: add.name,
                priority_order: add.priority,
                inserted_seq: 0,
                phone_number: add.phone,
                outreach_methods: parse_channels(&add.methods)?,
                is_active: !add.inactive,
                notify_scam: notify.scam,
                notify_emotional: notify.emotional,
                notify_silence: notify.silence,
                notify_cognitive: notify.cognitive,
                notify_routine: notify.routine,
            };
            store.insert_contact(&contact)?;
            println!(
                "contact_id={} person_id={} priority={}",
                contact.contact_id, contact.person_id, contact.priority_order
            );
        }
        ContactSubcommand::List { db, person } => {
            let store = open_store(&db)?;
            let person_id = parse_person_id(&person)?;
            for contact in store.list_contacts(person_id)? {
                println!("{}", serde_json::to_string(&contact)?);
            }
        }
    }
    Ok(())
}

fn signal_command(args: SignalArgs) -> Result<()> {
    let SignalSubcommand::Submit(args) = args.command;
    let mut store = open_store(&args.db)?;
    let person_id = parse_person_id(&args.person)?;
    let category = SignalCategory::parse(&args.category)
        .ok_or_else(|| anyhow!("invalid category '{}'", args.category))?;

    let mut signal = CareSignal::new(person_id, category, args.risk, args.description.clone());
    if let Some(rationale) = &args.rationale {
        signal = signal.with_rationale(rationale.clone());
    }

    let telephony = telephony_from(args.telephony_config.as_deref())?;
    let messaging = messaging_from(args.messaging_config.as_deref())?;
    let mut orchestrator = CareOrchestrator::new(&mut store, telephony.as_ref(), messaging.as_ref());

    let outcome = orchestrator.submit_signal(&signal, now_utc())?;
    println!(
        "event_id={} layer={} adjusted_risk={} rationale={}",
        outcome.event.event_id,
        outcome.event.escalation_layer,
        outcome.decision.adjusted_risk,
        outcome.decision.rationale
    );
    Ok(())
}

fn events_command(args: EventsArgs) -> Result<()> {
    let EventsSubcommand::List { db, person, limit } = args.command;
    let store = open_store(&db)?;
    let person_id = parse_person_id(&person)?;
    for event in store.list_events_for_person(person_id, limit)? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn outcome_command(args: OutcomeArgs) -> Result<()> {
    let OutcomeSubcommand::Set { db, event, outcome } = args.command;
    let mut store = open_store(&db)?;
    let event_id =
        EventId::parse(&event).map_err(|err| anyhow!("invalid event id '{event}': {err}"))?;
    let outcome = EventOutcome::parse(&outcome).ok_or_else(|| {
        anyhow!("invalid outcome '{outcome}'; use pending|resolved|false_alarm|escalated")
    })?;
    store.set_outcome(event_id, outcome)?;
    println!("event_id={event_id} outcome={}", outcome.as_str());
    Ok(())
}

fn wellbeing_command(args: WellbeingArgs) -> Result<()> {
    let WellbeingSubcommand::Log(args) = args.command;
    let mut store = open_store(&args.db)?;
    let person_id = parse_person_id(&args.person)?;
    let logged_at = parse_optional_timestamp(args.at.as_deref())?;
    let sample = WellbeingSample {
        mood_score: args.mood,
        conversation_count: args.conversations,
        conversation_minutes: args.minutes,
        logged_at,
    };
    store.insert_wellbeing_log(person_id, &sample)?;
    println!("person_id={person_id} logged_at={logged_at}");
    Ok(())
}

fn interaction_command(args: InteractionArgs) -> Result<()> {
    let InteractionSubcommand::Record { db, person, at } = args.command;
    let mut store = open_store(&db)?;
    let person_id = parse_person_id(&person)?;
    let occurred_at = parse_optional_timestamp(at.as_deref())?;
    store.record_interaction(person_id, occurred_at)?;
    println!("person_id={person_id} occurred_at={occurred_at}");
    Ok(())
}

fn monitor_command(args: MonitorArgs) -> Result<()> {
    match args.command {
        MonitorSubcommand::Silence(tick) => {
            let mut store = open_store(&tick.db)?;
            let telephony = telephony_from(tick.telephony_config.as_deref())?;
            let messaging = messaging_from(tick.messaging_config.as_deref())?;
            let mut orchestrator =
                CareOrchestrator::new(&mut store, telephony.as_ref(), messaging.as_ref());
            let report = orchestrator.run_silence_tick(now_utc())?;
            println!(
                "checked={} raised={} errors={}",
                report.persons_checked,
                report.signals_raised.len(),
                report.errors.len()
            );
        }
        MonitorSubcommand::Baseline(tick) => {
            let mut store = open_store(&tick.db)?;
            let telephony = telephony_from(tick.telephony_config.as_deref())?;
            let messaging = messaging_from(tick.messaging_config.as_deref())?;
            let mut orchestrator =
                CareOrchestrator::new(&mut store, telephony.as_ref(), messaging.as_ref());
            let report = orchestrator.run_baseline_tick(now_utc())?;
            println!(
                "refreshed={} errors={}",
                report.persons_refreshed,
                report.errors.len()
            );
        }
        MonitorSubcommand::Run(run) => {
            let mut store = open_store(&run.db)?;
            let telephony = telephony_from(run.telephony_config.as_deref())?;
            let messaging = messaging_from(run.messaging_config.as_deref())?;
            let mut orchestrator =
                CareOrchestrator::new(&mut store, telephony.as_ref(), messaging.as_ref());
            let mut schedule = MonitorSchedule::hourly_daily(now_utc());
            run_monitors(&mut orchestrator, &mut schedule, run.rounds)?;
        }
    }
    Ok(())
}

fn open_store(path: &Path) -> Result<SqliteCareStore> {
    let store = SqliteCareStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn parse_person_id(input: &str) -> Result<PersonId> {
    PersonId::parse(input).map_err(|err| anyhow!("invalid person id '{input}': {err}"))
}

fn parse_optional_timestamp(input: Option<&str>) -> Result<OffsetDateTime> {
    match input {
        Some(raw) => {
            parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp '{raw}': {err}"))
        }
        None => Ok(now_utc()),
    }
}

fn parse_channels(input: &str) -> Result<Vec<OutreachChannel>> {
    let mut channels = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let channel = OutreachChannel::parse(part)
            .ok_or_else(|| anyhow!("invalid channel '{part}'; use whatsapp|sms"))?;
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    if channels.is_empty() {
        return Err(anyhow!("at least one outreach channel is required"));
    }
    Ok(channels)
}

#[derive(Debug, Default)]
struct NotifyFamilies {
    scam: bool,
    emotional: bool,
    silence: bool,
    cognitive: bool,
    routine: bool,
}

fn parse_notify_families(input: &str) -> Result<NotifyFamilies> {
    let mut families = NotifyFamilies::default();
    for part in input.split(',') {
        let part = part.trim();
        match part {
            "" => {}
            "scam" => families.scam = true,
            "emotional" => families.emotional = true,
            "silence" => families.silence = true,
            "cognitive" => families.cognitive = true,
            "routine" => families.routine = true,
            other => {
                return Err(anyhow!(
                    "invalid notify family '{other}'; use scam|emotional|silence|cognitive|routine"
                ))
            }
        }
    }
    Ok(families)
}

fn telephony_from(path: Option<&Path>) -> Result<Box<dyn TelephonyDispatch>> {
    match path {
        Some(path) => {
            let config = load_channel_config(path)?;
            Ok(Box::new(HttpTelephony::new(config)))
        }
        None => Ok(Box::new(DryRunTelephony)),
    }
}

fn messaging_from(path: Option<&Path>) -> Result<Box<dyn MessagingGateway>> {
    match path {
        Some(path) => {
            let config = load_channel_config(path)?;
            Ok(Box::new(HttpMessaging::new(config)))
        }
        None => Ok(Box::new(DryRunMessaging)),
    }
}

fn load_channel_config(path: &Path) -> Result<HttpChannelConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read channel config {}", path.display()))?;
    let params: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in channel config {}", path.display()))?;
    HttpChannelConfig::from_params(&params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_parse_in_order_and_dedupe() {
        let channels = match parse_channels("whatsapp, sms, whatsapp") {
            Ok(channels) => channels,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert_eq!(
            channels,
            vec![OutreachChannel::Whatsapp, OutreachChannel::Sms]
        );
    }

    #[test]
    fn empty_channel_list_is_rejected() {
        assert!(parse_channels(" , ").is_err());
    }

    #[test]
    fn notify_families_parse() {
        let families = match parse_notify_families("scam,silence") {
            Ok(families) => families,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert!(families.scam);
        assert!(families.silence);
        assert!(!families.emotional);
        assert!(!families.routine);
    }

    #[test]
    fn unknown_notify_family_is_rejected() {
        assert!(parse_notify_families("neighbours").is_err());
    }

    #[test]
    fn every_command_takes_a_verb() {
        let person = "01J00000000000000000000000";
        let cases: Vec<Vec<&str>> = vec![
            vec![
                "care-engine",
                "signal",
                "submit",
                "--db",
                "care.sqlite",
                "--person",
                person,
                "--category",
                "scam",
                "--risk",
                "9",
                "--description",
                "wire transfer request",
            ],
            vec![
                "care-engine",
                "events",
                "list",
                "--db",
                "care.sqlite",
                "--person",
                person,
            ],
            vec![
                "care-engine",
                "outcome",
                "set",
                "--db",
                "care.sqlite",
                "--event",
                person,
                "--outcome",
                "resolved",
            ],
            vec![
                "care-engine",
                "wellbeing",
                "log",
                "--db",
                "care.sqlite",
                "--person",
                person,
                "--mood",
                "4.0",
                "--conversations",
                "2",
                "--minutes",
                "12.5",
            ],
            vec![
                "care-engine",
                "interaction",
                "record",
                "--db",
                "care.sqlite",
                "--person",
                person,
            ],
        ];
        for case in cases {
            if let Err(err) = Cli::try_parse_from(&case) {
                panic!("failed to parse {case:?}: {err}");
            }
        }
    }
}
