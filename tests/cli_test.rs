use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_describes_commands() {
    let mut cmd = Command::cargo_bin("tickframe").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_no_command_shows_guidance() {
    let mut cmd = Command::cargo_bin("tickframe").unwrap();

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("tickframe run"));
}

#[test]
fn test_config_prints_toml() {
    let mut cmd = Command::cargo_bin("tickframe").unwrap();

    cmd.arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[performance]"))
        .stdout(predicate::str::contains("max_tick_budget_ms"));
}

#[test]
fn test_run_prints_status_tree_as_json() {
    let mut cmd = Command::cargo_bin("tickframe").unwrap();

    cmd.env("RUST_LOG", "off")
        .args(["run", "--ticks", "40", "--tick-ms", "1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"root\""))
        .stdout(predicate::str::contains("demo-scene"));
}

#[test]
fn test_run_reports_unloaded_scene() {
    let mut cmd = Command::cargo_bin("tickframe").unwrap();

    cmd.env("RUST_LOG", "off")
        .args(["run", "--ticks", "40", "--tick-ms", "1", "--unload-after", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Module: none"));
}
