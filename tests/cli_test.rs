mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::{instruction_file, report_row};
use predicates::prelude::*;
use std::process::Command;

const ALICE: &str = "6f1c2a9e-7d1b-4c55-9a55-0b1f3c3b8d11";
const BOB: &str = "0d3b5c7a-2e4f-4a61-8b9c-1d2e3f4a5b6c";

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let csv = instruction_file(&[
        format!("{ALICE}, approved, rail-a, brk-a, dep-a1, 100, completed"),
        format!("{ALICE}, approved, rail-a, brk-a, dep-a2, 20, failed"),
        format!("{ALICE}, approved, rail-a, brk-a, dep-a3, 30, pending"),
    ]);

    let output = Command::new(cargo_bin!("fundrail")).arg(csv.path()).output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;

    assert!(stdout.starts_with("reference,user,status,amount,destination_amount,provider_tx_id"));

    let funded = report_row(&stdout, "dep-a1").expect("dep-a1 in report");
    assert_eq!(funded[1], ALICE);
    assert_eq!(funded[2], "broker_funded");
    assert_eq!(funded[3], "100");
    assert!(funded[4].starts_with("99.5"));
    assert!(funded[5].starts_with("tr_"));

    let failed = report_row(&stdout, "dep-a2").expect("dep-a2 in report");
    assert_eq!(failed[2], "failed");
    assert_eq!(failed[4], "");

    let pending = report_row(&stdout, "dep-a3").expect("dep-a3 in report");
    assert_eq!(pending[2], "rail_initiated");

    Ok(())
}

#[test]
fn test_cli_limit_denied_row_is_not_created() {
    // Unverified users may deposit 100 per day.
    let csv = instruction_file(&[
        format!("{BOB}, pending, rail-b, brk-b, dep-b1, 60, completed"),
        format!("{BOB}, pending, rail-b, brk-b, dep-b2, 50, completed"),
        format!("{BOB}, pending, rail-b, brk-b, dep-b3, 40, completed"),
    ]);

    let output = Command::new(cargo_bin!("fundrail"))
        .arg(csv.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert_eq!(report_row(&stdout, "dep-b1").unwrap()[2], "broker_funded");
    assert!(report_row(&stdout, "dep-b2").is_none());
    assert_eq!(report_row(&stdout, "dep-b3").unwrap()[2], "broker_funded");
    assert!(stderr.contains("instruction rejected"));
}

#[test]
fn test_cli_skips_malformed_and_duplicate_rows() {
    let csv = instruction_file(&[
        format!("{ALICE}, approved, rail-a, brk-a, dep-1, 10, completed"),
        format!("{ALICE}, approved, rail-a, brk-a, dep-2, not_a_number, completed"),
        format!("not-a-uuid, approved, rail-a, brk-a, dep-3, 10, completed"),
        format!("{ALICE}, approved, rail-a, brk-a, dep-4, -5, completed"),
        format!("{ALICE}, approved, rail-a, brk-a, dep-1, 10, completed"),
        format!("{ALICE}, approved, rail-a, brk-a, dep-5, 5, completed"),
    ]);

    let mut cmd = Command::new(cargo_bin!("fundrail"));
    cmd.arg(csv.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("error reading instruction"))
        .stderr(predicate::str::contains("instruction rejected"))
        .stdout(predicate::str::contains("dep-1,"))
        .stdout(predicate::str::contains("dep-5,"))
        .stdout(predicate::str::contains("dep-2,").not())
        .stdout(predicate::str::contains("dep-3,").not())
        .stdout(predicate::str::contains("dep-4,").not());

    let output = Command::new(cargo_bin!("fundrail"))
        .arg(csv.path())
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().filter(|l| l.starts_with("dep-1,")).count(), 1);
}

#[test]
fn test_cli_account_owned_by_other_user() {
    let csv = instruction_file(&[
        format!("{ALICE}, approved, rail-shared, brk-a, dep-1, 10, completed"),
        format!("{BOB}, approved, rail-shared, brk-b, dep-2, 10, completed"),
    ]);

    let mut cmd = Command::new(cargo_bin!("fundrail"));
    cmd.arg(csv.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("does not belong to user"))
        .stdout(predicate::str::contains("dep-1,"))
        .stdout(predicate::str::contains("dep-2,").not());
}

#[test]
fn test_cli_rejects_invalid_config() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut config, br#"{ "retry": { "max_attempts": 0 } }"#).unwrap();
    let csv = instruction_file::<&str>(&[]);

    let mut cmd = Command::new(cargo_bin!("fundrail"));
    cmd.arg(csv.path()).arg("--config").arg(config.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("max_attempts"));
}
