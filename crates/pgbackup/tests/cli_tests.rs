//! CLI integration tests for pgbackup.
//!
//! These tests cover argument parsing, help output and exit codes for errors that
//! stop a run before any database is attempted.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the pgbackup binary with logging kept out of the working tree.
fn cmd(logs: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pgbackup").unwrap();
    cmd.env("PGBACKUP_LOG_DIR", logs.path())
        .env_remove("PGHOST")
        .env_remove("PGPORT")
        .env_remove("PGUSER")
        .env_remove("PGPASSWORD");
    cmd
}

#[test]
fn test_help_lists_options() {
    let logs = TempDir::new().unwrap();
    cmd(&logs)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-dir"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--exclude-database"))
        .stdout(predicate::str::contains("--isolation"))
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_version_flag() {
    let logs = TempDir::new().unwrap();
    cmd(&logs).arg("--version").assert().success().stdout(predicate::str::contains("pgbackup"));
}

#[test]
fn test_help_hides_password_value() {
    let logs = TempDir::new().unwrap();
    cmd(&logs)
        .env("PGPASSWORD", "hunter2")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_unknown_flag_fails() {
    let logs = TempDir::new().unwrap();
    cmd(&logs)
        .arg("--definitely-not-a-flag")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unexpected argument"));
}

#[test]
fn test_invalid_isolation_fails() {
    let logs = TempDir::new().unwrap();
    cmd(&logs)
        .args(["--isolation", "read-committed"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown isolation level"));
}

#[test]
fn test_invalid_workers_is_fatal() {
    let logs = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    cmd(&logs)
        .args(["--workers", "0", "--output-dir"])
        .arg(out.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Workers must be between 1 and 64"));
}

#[test]
fn test_missing_output_dir_without_create_is_fatal() {
    let logs = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    cmd(&logs)
        .args(["--host", "127.0.0.1", "--port", "1", "--no-create-dir", "--output-dir"])
        .arg(out.path().join("missing"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
    assert!(!out.path().join("missing").exists());
}

#[test]
fn test_unreachable_server_is_fatal() {
    let logs = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    cmd(&logs)
        .args(["--host", "127.0.0.1", "--port", "1", "--connect-timeout", "2", "--output-dir"])
        .arg(out.path())
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error:"));
}
