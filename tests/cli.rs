//! CLI surface checks.

use assert_cmd::Command;
use tempfile::TempDir;

#[test]
fn help_describes_both_modes() {
    Command::cargo_bin("groom")
        .expect("groom binary")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("--execute"));
}

#[test]
fn executor_mode_without_a_plan_exits_cleanly() {
    let tmp = TempDir::new().expect("create state dir");
    Command::cargo_bin("groom")
        .expect("groom binary")
        .arg("--execute")
        .env("GROOM_STATE_DIR", tmp.path())
        .assert()
        .success();
}

#[test]
fn executor_mode_leaves_non_prepare_state_alone() {
    let tmp = TempDir::new().expect("create state dir");
    std::fs::write(
        tmp.path().join("operations.json"),
        r#"{"state":"Done"}"#,
    )
    .expect("seed record");

    Command::cargo_bin("groom")
        .expect("groom binary")
        .arg("--execute")
        .env("GROOM_STATE_DIR", tmp.path())
        .assert()
        .success();

    let record = std::fs::read_to_string(tmp.path().join("operations.json")).unwrap();
    assert!(record.contains("Done"), "record changed: {record}");
}
