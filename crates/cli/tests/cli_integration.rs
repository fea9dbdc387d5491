//! CLI integration tests for the non-server subcommands.
//!
//! Uses `assert_cmd` to spawn the `tracksync` binary in a temporary working
//! directory and verify exit codes and output.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `tracksync` command rooted in `dir`, isolated from the caller's env.
fn tracksync(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("tracksync");
    cmd.current_dir(dir.path());
    for var in [
        "TRACKSYNC_PORT",
        "TRACKSYNC_API_KEY",
        "TRACKSYNC_STORAGE_BACKEND",
        "TRACKSYNC_STORAGE_PATH",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    tracksync(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("purge"));
}

#[test]
fn config_prints_defaults_without_a_file() {
    let dir = TempDir::new().unwrap();
    let output = tracksync(&dir).arg("config").assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let config: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(config["server"]["port"], 8080);
    assert_eq!(config["storage"]["backend"], "sqlite");
    assert_eq!(config["engine"]["workers"], 4);
}

#[test]
fn config_layers_file_env_and_flags() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("tracksync.toml"),
        "[server]\nport = 9000\napi_key = \"hidden\"\n\n[engine]\nworkers = 2\n",
    )
    .unwrap();

    let output = tracksync(&dir)
        .env("TRACKSYNC_STORAGE_BACKEND", "file")
        .args(["--storage-path", "elsewhere", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hidden").not());
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let config: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(config["server"]["port"], 9000);
    assert_eq!(config["engine"]["workers"], 2);
    assert_eq!(config["storage"]["backend"], "file");
    assert_eq!(config["storage"]["path"], "elsewhere");
}

#[test]
fn malformed_config_exits_2() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "[server\nport = ").unwrap();
    tracksync(&dir)
        .args(["--config", "bad.toml", "config"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid config file"));
}

#[test]
fn purge_on_fresh_store_removes_nothing() {
    let dir = TempDir::new().unwrap();
    tracksync(&dir)
        .args(["--storage-path", "ops.db", "purge", "--older-than-days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("purged 0 snapshot(s)"));
    assert!(dir.path().join("ops.db").exists());
}

#[test]
fn purge_works_with_file_backend() {
    let dir = TempDir::new().unwrap();
    tracksync(&dir)
        .args(["--storage-backend", "file", "--storage-path", "data", "purge"])
        .assert()
        .success()
        .stdout(predicate::str::contains("older than 30 day(s)"));
}
