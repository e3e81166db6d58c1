//! CLI integration tests for mssql-db-copy.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for errors raised before any connection is opened.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

const SOURCE: &str = "Server=tcp:127.0.0.1,1;Database=Src;User Id=sa;Password=secret";
const TARGET: &str = "Server=tcp:127.0.0.1,1;Database=Dst;User Id=sa;Password=secret";

/// Get a command for the mssql-db-copy binary.
fn cmd() -> Command {
    Command::cargo_bin("mssql-db-copy").unwrap()
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_arguments_and_modes() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("<SOURCE>"))
        .stdout(predicate::str::contains("<TARGET>"))
        .stdout(predicate::str::contains("--schema-only"))
        .stdout(predicate::str::contains("--data-only"))
        .stdout(predicate::str::contains("--no-log"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("mssql-db-copy"));
}

#[test]
fn test_log_format_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"));
}

#[test]
fn test_verbosity_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_output_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--progress-json"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_short_config_flag() {
    // -c should work as short for --config
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

// =============================================================================
// Argument Errors (clap, exit code 2)
// =============================================================================

#[test]
fn test_missing_connection_strings() {
    cmd()
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_missing_target() {
    cmd()
        .arg(SOURCE)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("<TARGET>"));
}

#[test]
fn test_schema_only_conflicts_with_data_only() {
    cmd()
        .args([SOURCE, TARGET, "--schema-only", "--data-only"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_mode_flag_aliases() {
    cmd()
        .args([SOURCE, TARGET, "--SchemaOnly", "--dataonly"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_help_mentions_flag_aliases() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--SchemaOnly"))
        .stdout(predicate::str::contains("--NoLog"));
}

// =============================================================================
// Fatal Errors (exit code 255)
// =============================================================================

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--no-log", "--config", "nonexistent_config_file.yaml", SOURCE, TARGET])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--no-log", "--config", file.path().to_str().unwrap(), SOURCE, TARGET])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("YAML error"));
}

#[test]
fn test_invalid_setting_in_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "migration:").unwrap();
    writeln!(file, "  max_attempts: 0").unwrap();

    cmd()
        .args(["--no-log", "--config", file.path().to_str().unwrap(), SOURCE, TARGET])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("max_attempts"));
}

#[test]
fn test_same_source_and_target() {
    cmd()
        .args(["--NoLog", SOURCE, SOURCE])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("cannot be the same database"));
}

#[test]
fn test_zero_workers() {
    cmd()
        .args(["--no-log", "--workers", "0", SOURCE, TARGET])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("workers must be at least 1"));
}

#[test]
fn test_unknown_log_format() {
    cmd()
        .args(["--no-log", "--log-format", "xml", SOURCE, TARGET])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("Unknown log format"));
}
