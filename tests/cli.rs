use assert_cmd::Command;
use predicates::prelude::*;

fn bin() -> Command {
    Command::cargo_bin("vqa_backend").unwrap()
}

#[test]
fn normalize_mode_prints_normalized_text() {
    bin()
        .args(["--normalize", "H3ll0 W0rld!!!"])
        .assert()
        .success()
        .stdout("hello world!\n");
}

#[test]
fn normalize_mode_handles_noise_and_missing_value() {
    bin()
        .args(["--normalize", "wh@t$ up???"])
        .assert()
        .success()
        .stdout("whats up?\n");

    bin().arg("--normalize").assert().success().stdout("\n");
}

#[test]
fn version_mode_prints_package_version() {
    bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn invalid_settings_fail_before_model_load() {
    bin()
        .env("VQA_BIND_ADDR", "not-an-address")
        .env("VQA_MODEL_DIR", std::env::temp_dir())
        .assert()
        .failure()
        .stderr(predicate::str::contains("VQA_BIND_ADDR"));
}
