//! Tests for the ec binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

const SCAN_CONFIG: &str = r#"
parameters:
  - name: x
    lower: -1.0
    upper: 1.0
    start: 0.0
pipeline:
  poll-interval-ms: 10
  steps:
    - name: square
      code: user
      executable: sh
      args: ["-c", "echo '{{params.x}}' | awk '{print $1 * $1}' > objective.txt"]
scan:
  method: grid
  points-per-dim: 3
manager:
  workers: 2
"#;

/// Binary with logs and user config redirected into `temp`
fn ec(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ec").unwrap();
    cmd.current_dir(temp.path())
        .env("XDG_DATA_HOME", temp.path().join("data"))
        .env("XDG_CONFIG_HOME", temp.path().join("config"));
    cmd
}

fn write_config(temp: &TempDir, yaml: &str) -> PathBuf {
    let path = temp.path().join("campaign.yml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn only_file(dir: &Path) -> PathBuf {
    let mut entries: Vec<_> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(entries.len(), 1, "expected one file in {}", dir.display());
    entries.remove(0)
}

#[test]
fn test_help() {
    let temp = tempdir().unwrap();
    ec(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Evaluation coordinator"))
        .stdout(predicate::str::contains("history"));
}

#[test]
fn test_validate_prints_pipeline() {
    let temp = tempdir().unwrap();
    let config = write_config(&temp, SCAN_CONFIG);
    ec(&temp)
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("square"));
}

#[test]
fn test_validate_rejects_bad_bounds() {
    let temp = tempdir().unwrap();
    let config = write_config(&temp, &SCAN_CONFIG.replace("lower: -1.0", "lower: 3.0"));
    ec(&temp)
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("lower"));
}

#[test]
fn test_scan_json_then_history() {
    let temp = tempdir().unwrap();
    let config = write_config(&temp, SCAN_CONFIG);
    let out = temp.path().join("out");

    ec(&temp)
        .arg("-c")
        .arg(&config)
        .args(["scan", "--format", "json", "--output"])
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"terminal\": \"completed\""));

    let history = only_file(&out);
    assert!(history.to_string_lossy().ends_with(".csv"));

    ec(&temp)
        .arg("history")
        .arg(&history)
        .assert()
        .success()
        .stdout(predicate::str::contains("3 rows, 3 returned"));

    ec(&temp)
        .arg("history")
        .arg(&history)
        .args(["--format", "json", "--top", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"best\""));
}

#[test]
fn test_run_without_optimizer_fails() {
    let temp = tempdir().unwrap();
    let config = write_config(&temp, SCAN_CONFIG);
    ec(&temp)
        .arg("-c")
        .arg(&config)
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("optimizer"));
}

#[test]
fn test_history_missing_file_fails() {
    let temp = tempdir().unwrap();
    ec(&temp)
        .args(["history", "nope.csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load history"));
}

#[test]
fn test_invalid_log_level_fails() {
    let temp = tempdir().unwrap();
    let config = write_config(&temp, SCAN_CONFIG);
    ec(&temp)
        .arg("-c")
        .arg(&config)
        .args(["--log-level", "loud", "validate"])
        .assert()
        .failure();
}
