use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Output};

use care_engine_core::{format_rfc3339, now_utc, EventId, EventOutcome, OutreachChannel, PersonId};
use care_engine_store_sqlite::SqliteCareStore;
use time::Duration;
use ulid::Ulid;

fn temp_db(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("care-engine-test-{name}-{}.sqlite", Ulid::new()))
}

fn run_cli<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(env!("CARGO_BIN_EXE_care-engine"))
        .args(args)
        .output();
    match output {
        Ok(output) => output,
        Err(err) => panic!("failed to spawn care-engine binary: {err}"),
    }
}

fn run_ok<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_cli(args);
    assert!(
        output.status.success(),
        "stdout={}; stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn extract_field(stdout: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    stdout
        .split_whitespace()
        .find_map(|token| token.strip_prefix(&prefix).map(ToString::to_string))
}

fn must_field(stdout: &str, key: &str) -> String {
    match extract_field(stdout, key) {
        Some(value) => value,
        None => panic!("missing '{key}=' in output: {stdout}"),
    }
}

fn rfc3339_hours_ago(hours: i64) -> String {
    match format_rfc3339(now_utc() - Duration::hours(hours)) {
        Ok(formatted) => formatted,
        Err(err) => panic!("failed to format timestamp: {err}"),
    }
}

#[test]
fn severe_scam_signal_flows_from_intake_to_reviewed_outcome() {
    let db = temp_db("scam-flow");
    let db_arg = db.display().to_string();

    let stdout = run_ok([
        "person", "add", "--db", db_arg.as_str(), "--name", "Rosa", "--phone", "+5215511112222",
    ]);
    let person_id = must_field(&stdout, "person_id");

    run_ok([
        "contact", "add", "--db", db_arg.as_str(), "--person", person_id.as_str(), "--name", "Marta", "--phone",
        "+5215533334444",
    ]);

    let stdout = run_ok([
        "signal",
        "submit",
        "--db",
        db_arg.as_str(),
        "--person",
        person_id.as_str(),
        "--category",
        "scam",
        "--risk",
        "9",
        "--description",
        "caller asked her to wire money",
    ]);
    let event_id = must_field(&stdout, "event_id");
    assert_eq!(must_field(&stdout, "layer"), "4");

    let stdout = run_ok(["events", "list", "--db", db_arg.as_str(), "--person", person_id.as_str()]);
    assert!(stdout.contains(&event_id));
    assert!(stdout.contains("escalated"));

    run_ok([
        "outcome", "set", "--db", db_arg.as_str(), "--event", event_id.as_str(), "--outcome", "resolved",
    ]);

    let store = match SqliteCareStore::open(&db) {
        Ok(store) => store,
        Err(err) => panic!("failed to reopen store: {err}"),
    };
    let person_id = match PersonId::parse(&person_id) {
        Ok(id) => id,
        Err(err) => panic!("bad person id in output: {err}"),
    };
    let event_id = match EventId::parse(&event_id) {
        Ok(id) => id,
        Err(err) => panic!("bad event id in output: {err}"),
    };
    let event = match store.get_event(event_id) {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event not found after CLI flow"),
        Err(err) => panic!("failed to read event: {err}"),
    };

    assert_eq!(event.person_id, person_id);
    assert_eq!(event.escalation_layer, 4);
    assert_eq!(event.risk_score, 9);
    assert_eq!(event.external_contact_method, Some(OutreachChannel::Whatsapp));
    assert!(event.external_contact_id.is_some());
    // Reviewer verdict wins over the dispatcher's 'escalated' marker.
    assert_eq!(event.outcome, EventOutcome::Resolved);
}

#[test]
fn disabled_care_logs_tier_zero_via_cli() {
    let db = temp_db("disabled");
    let db_arg = db.display().to_string();

    let stdout = run_ok([
        "person", "add", "--db", db_arg.as_str(), "--name", "Pedro", "--phone", "+5215599998888",
    ]);
    let person_id = must_field(&stdout, "person_id");

    let stdout = run_ok([
        "settings", "set", "--db", db_arg.as_str(), "--person", person_id.as_str(), "--enabled", "false",
    ]);
    assert!(stdout.contains("\"care_enabled\":false"));

    let stdout = run_ok([
        "signal",
        "submit",
        "--db",
        db_arg.as_str(),
        "--person",
        person_id.as_str(),
        "--category",
        "help_request",
        "--risk",
        "10",
        "--description",
        "asked for help",
    ]);
    assert_eq!(must_field(&stdout, "layer"), "0");
}

#[test]
fn monitor_ticks_raise_a_silence_event_once() {
    let db = temp_db("monitor");
    let db_arg = db.display().to_string();

    let stdout = run_ok([
        "person", "add", "--db", db_arg.as_str(), "--name", "Ana", "--phone", "+5215577776666",
    ]);
    let person_id = must_field(&stdout, "person_id");

    let quiet_since = rfc3339_hours_ago(61);
    run_ok([
        "interaction", "record", "--db", db_arg.as_str(), "--person", person_id.as_str(), "--at", quiet_since.as_str(),
    ]);
    run_ok([
        "wellbeing",
        "log",
        "--db",
        db_arg.as_str(),
        "--person",
        person_id.as_str(),
        "--mood",
        "4.0",
        "--conversations",
        "2",
        "--minutes",
        "12.5",
    ]);

    let stdout = run_ok(["monitor", "baseline", "--db", db_arg.as_str()]);
    assert_eq!(must_field(&stdout, "refreshed"), "1");
    assert_eq!(must_field(&stdout, "errors"), "0");

    let stdout = run_ok(["monitor", "silence", "--db", db_arg.as_str()]);
    assert_eq!(must_field(&stdout, "checked"), "1");
    assert_eq!(must_field(&stdout, "raised"), "1");

    // Re-running immediately records the repeat at tier 0 (cooldown).
    run_ok(["monitor", "silence", "--db", db_arg.as_str()]);

    let stdout = run_ok(["events", "list", "--db", db_arg.as_str(), "--person", person_id.as_str()]);
    assert!(stdout.contains("\"category\":\"silence\""));
    let actionable = stdout
        .lines()
        .filter(|line| !line.contains("\"escalation_layer\":0"))
        .count();
    assert_eq!(actionable, 1);
}
