//! End-to-end tests for the thin CLI front end.
//!
//! Out of scope as a specified component (§1), but exercised here the way
//! the teacher declares `assert_cmd`/`predicates` as dev-dependencies for
//! driving its own binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn init_writes_config_then_validate_reads_it_back() {
    let dir = tempfile::tempdir().unwrap();

    let mut init = Command::cargo_bin("nac-test-core").unwrap();
    init.current_dir(dir.path()).arg("init");
    init.assert()
        .success()
        .stdout(predicate::str::contains("created nac-test-core.toml"));

    assert!(dir.path().join("nac-test-core.toml").exists());

    let mut validate = Command::cargo_bin("nac-test-core").unwrap();
    validate
        .current_dir(dir.path())
        .arg("--config")
        .arg("nac-test-core.toml")
        .arg("validate");
    validate
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration is valid"));
}

#[test]
fn init_refuses_to_overwrite_existing_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("nac-test-core.toml"), "debug = true\n").unwrap();

    let mut init = Command::cargo_bin("nac-test-core").unwrap();
    init.current_dir(dir.path()).arg("init");
    init.assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn validate_reports_error_for_malformed_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("nac-test-core.toml");
    std::fs::write(&config_path, "this is not valid toml =\n=").unwrap();

    let mut validate = Command::cargo_bin("nac-test-core").unwrap();
    validate
        .current_dir(dir.path())
        .arg("--config")
        .arg("nac-test-core.toml")
        .arg("validate");
    validate.assert().failure();
}

#[test]
fn discover_reports_zero_tests_in_an_empty_tree() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("tests")).unwrap();
    std::fs::write(dir.path().join("nac-test-core.toml"), "").unwrap();

    let mut discover = Command::cargo_bin("nac-test-core").unwrap();
    discover
        .current_dir(dir.path())
        .arg("--config")
        .arg("nac-test-core.toml")
        .arg("discover");
    discover
        .assert()
        .success()
        .stdout(predicate::str::contains("api lane (0 tests)"))
        .stdout(predicate::str::contains("d2d lane (0 tests)"));
}
