//! Integration tests for the bms-batch CLI.
//!
//! These tests run the actual binary against temporary account snapshots.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

const SCENARIO: &str = "id,owner_name,balance\nA1,Alice,100\nA2,Bob,250\nA3,Carol,-30\n";

const EXPECTED: &str = "account,balance\nA1,100.0000\nA2,250.0000\nA3,-30.0000\ntotal,320.0000\n";

/// Write CSV content to a temp file that lives as long as the returned handle
fn snapshot(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn bms() -> Command {
    let mut cmd = Command::cargo_bin("bms-batch").unwrap();
    for var in ["BMS_STRATEGY", "BMS_WORKERS", "BMS_NOTIFY_TO", "BMS_SMTP_HOST"] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_threaded_scenario() {
    let file = snapshot(SCENARIO);
    bms()
        .arg(file.path())
        .arg("threaded")
        .env("BMS_WORKERS", "2")
        .assert()
        .success()
        .stdout(EXPECTED);
}

#[test]
fn test_cooperative_scenario_matches_threaded() {
    let file = snapshot(SCENARIO);
    bms()
        .arg(file.path())
        .arg("cooperative")
        .assert()
        .success()
        .stdout(EXPECTED);
}

#[test]
fn test_strategy_from_environment() {
    let file = snapshot(SCENARIO);
    bms()
        .arg(file.path())
        .env("BMS_STRATEGY", "cooperative")
        .assert()
        .success()
        .stdout(EXPECTED);
}

#[test]
fn test_malformed_rows_are_skipped() {
    let file = snapshot("id,owner_name,balance\nA1,Alice,100\nA2,Bob,oops\nA3,Carol,-30\n");
    bms()
        .arg(file.path())
        .assert()
        .success()
        .stdout("account,balance\nA1,100.0000\nA3,-30.0000\ntotal,70.0000\n");
}

#[test]
fn test_summary_mail_does_not_change_output() {
    let file = snapshot(SCENARIO);
    bms()
        .arg(file.path())
        .env("BMS_NOTIFY_TO", "ops@example.com")
        .env("BMS_DRAIN_DEADLINE_MS", "500")
        .assert()
        .success()
        .stdout(EXPECTED);
}

#[test]
fn test_unreachable_smtp_relay_does_not_change_output() {
    let file = snapshot(SCENARIO);
    bms()
        .arg(file.path())
        .env("BMS_NOTIFY_TO", "ops@example.com")
        .env("BMS_SMTP_HOST", "127.0.0.1")
        .env("BMS_SMTP_PORT", "1")
        .env("BMS_SMTP_TLS", "false")
        .env("BMS_MAX_RETRIES", "0")
        .env("BMS_DRAIN_DEADLINE_MS", "3000")
        .assert()
        .success()
        .stdout(EXPECTED);
}

#[test]
fn test_balance_overflow_is_an_error_not_a_crash() {
    let file = snapshot(
        "id,owner_name,balance\nA1,Alice,7922816251426433759354395.0335\nA2,Bob,7922816251426433759354395.0335\n",
    );
    for strategy in ["threaded", "cooperative"] {
        bms()
            .arg(file.path())
            .arg(strategy)
            .env("BMS_WORKERS", "2")
            .assert()
            .code(1)
            .stderr(predicate::str::contains("balance overflow"));
    }
}

#[test]
fn test_empty_snapshot_fails() {
    let file = snapshot("id,owner_name,balance\n");
    bms()
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch contains no accounts"));
}

#[test]
fn test_missing_argument() {
    bms()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing input file argument"));
}

#[test]
fn test_unknown_strategy() {
    let file = snapshot(SCENARIO);
    bms()
        .arg(file.path())
        .arg("fastest")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown strategy"));
}

#[test]
fn test_nonexistent_file() {
    bms()
        .arg("no/such/accounts.csv")
        .assert()
        .failure()
        .stderr(predicate::str::contains("I/O error"));
}
