//! CLI smoke tests.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    let db = dir.path().join("logs.db");
    std::fs::write(
        &path,
        format!(
            "[database.processing_logs]\nenabled = true\npath = {:?}\n",
            db.to_string_lossy()
        ),
    )
    .unwrap();
    path
}

#[test]
fn schemas_lists_builtin_schemas_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    Command::cargo_bin("docstream")
        .unwrap()
        .args(["schemas", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""key": "invoice""#))
        .stdout(predicate::str::contains(r#""key": "invoices""#));
}

#[test]
fn runs_on_a_fresh_ledger_prints_an_empty_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    Command::cargo_bin("docstream")
        .unwrap()
        .args(["runs", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn unknown_subcommands_fail() {
    Command::cargo_bin("docstream")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}
