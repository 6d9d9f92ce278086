use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("units.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_check_prints_start_waves() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
orchestrator:
  start_grace_secs: 1
units:
  - id: web
    command: /usr/bin/web
    depends_on: [api]
  - id: api
    command: /usr/bin/api
    depends_on: [db]
  - id: db
    command: /usr/bin/postgres
"#,
    );

    Command::cargo_bin("procvisor")
        .unwrap()
        .arg("--config")
        .arg(&path)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 units OK"))
        .stdout(predicate::str::contains("wave 1: db"))
        .stdout(predicate::str::contains("wave 2: api"))
        .stdout(predicate::str::contains("wave 3: web"));
}

#[test]
fn test_check_rejects_cycle() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
units:
  - id: a
    command: /bin/a
    depends_on: [b]
  - id: b
    command: /bin/b
    depends_on: [a]
"#,
    );

    Command::cargo_bin("procvisor")
        .unwrap()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_check_rejects_invalid_settings() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
orchestrator:
  max_concurrent_probes: 0
"#,
    );

    Command::cargo_bin("procvisor")
        .unwrap()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_concurrent_probes"));
}

#[test]
fn test_check_missing_config_fails() {
    let dir = TempDir::new().unwrap();

    Command::cargo_bin("procvisor")
        .unwrap()
        .args(["check", "--config"])
        .arg(dir.path().join("nope.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("procvisor")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("procvisor v"));
}
