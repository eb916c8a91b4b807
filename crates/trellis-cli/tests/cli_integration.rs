use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn trellis() -> Command {
    let mut cmd = Command::cargo_bin("trellis").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("TRELLIS_BASE_URL")
        .env_remove("TRELLIS_CONFIG")
        .env_remove("TRELLIS_TIMEOUT")
        .env_remove("TRELLIS_SEED");
    cmd
}

#[test]
fn test_help_exits_zero() {
    trellis()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("trellis"));
}

#[test]
fn test_run_passing_script() {
    let fixture = fixture_path("passing.trl");
    trellis()
        .args(["run", fixture.to_str().unwrap(), "--no-session-log", "--text", "h1=Dashboard"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello alice! on Dashboard"))
        .stderr(predicate::str::contains("passing.trl: ok"));
}

#[test]
fn test_run_without_canned_text_fails_assertion() {
    let fixture = fixture_path("passing.trl");
    trellis()
        .args(["run", fixture.to_str().unwrap(), "--no-session-log"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("passing.trl:16: [RT-005] Assertion failed: landed on dashboard"));
}

#[test]
fn test_run_failing_assertion() {
    let fixture = fixture_path("failing_assert.trl");
    trellis()
        .args(["run", fixture.to_str().unwrap(), "--no-session-log"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("total is 4"))
        .stdout(predicate::str::contains("unreachable").not())
        .stderr(predicate::str::contains("failing_assert.trl:3: [RT-005]"));
}

#[test]
fn test_run_exits_with_first_failure_code() {
    let parse_error = fixture_path("parse_error.trl");
    let failing = fixture_path("failing_assert.trl");
    trellis()
        .args([
            "run",
            parse_error.to_str().unwrap(),
            failing.to_str().unwrap(),
            "--no-session-log",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("[VR-002]"))
        .stderr(predicate::str::contains("[RT-005]"))
        .stderr(predicate::str::contains("0 of 2 scripts passed"));
}

#[test]
fn test_run_expands_globs() {
    let pattern = fixture_path("pass*.trl");
    trellis()
        .args(["run", pattern.to_str().unwrap(), "--no-session-log", "--text", "h1=Dashboard"])
        .assert()
        .success()
        .stderr(predicate::str::contains("passing.trl: ok"));
}

#[test]
fn test_run_uses_config_file_and_flags() {
    let script = fixture_path("config_check.trl");
    let config = fixture_path("config.json");
    trellis()
        .args(["run", script.to_str().unwrap(), "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://app.test/home 750 11"));

    trellis()
        .args([
            "run",
            script.to_str().unwrap(),
            "--config",
            config.to_str().unwrap(),
            "--base-url",
            "http://localhost:9000",
            "--timeout",
            "200",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://localhost:9000/home 200 11"));
}

#[test]
fn test_run_base_url_from_environment() {
    let script = fixture_path("config_check.trl");
    let config = fixture_path("config.json");
    trellis()
        .env("TRELLIS_BASE_URL", "http://env.test")
        .args(["run", script.to_str().unwrap(), "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://env.test/home"));
}

#[test]
fn test_run_missing_config_file() {
    let script = fixture_path("passing.trl");
    trellis()
        .args(["run", script.to_str().unwrap(), "--config", "no_such_config.json"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_run_missing_script() {
    trellis()
        .args(["run", "no_such_script.trl", "--no-session-log"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("no_such_script.trl: [IO-001]"));
}

#[test]
fn test_run_json_format() {
    let fixture = fixture_path("failing_assert.trl");
    let assert = trellis()
        .args(["run", fixture.to_str().unwrap(), "--no-session-log", "--format", "json"])
        .assert()
        .code(1);

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let summary: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(summary["passed"], false);
    assert_eq!(summary["error"]["code"], "RT-005");
    assert_eq!(summary["error"]["line"], 3);
}

#[test]
fn test_check_reports_diagnostics() {
    let ok = fixture_path("passing.trl");
    let bad = fixture_path("parse_error.trl");
    trellis()
        .args(["check", ok.to_str().unwrap(), bad.to_str().unwrap()])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("passing.trl: ok"))
        .stdout(predicate::str::contains("parse_error.trl:2: [VR-002]"));
}

#[test]
fn test_check_lexical_error() {
    let bad = fixture_path("lex_error.trl");
    trellis()
        .args(["check", bad.to_str().unwrap()])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("lex_error.trl:1: [LEX-002]"));
}

#[test]
fn test_tokens_dump() {
    let fixture = fixture_path("failing_assert.trl");
    trellis()
        .args(["tokens", fixture.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("1:1\t"))
        .stdout(predicate::str::contains("\"total\""));
}

#[test]
fn test_convert_session_log() {
    let fixture = fixture_path("session.jsonl");
    let assert = trellis()
        .args(["convert", fixture.to_str().unwrap()])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout.starts_with("\"\"\"\nversion: 1\n"));
    assert!(stdout.contains("navigate \"http://app.test/login\""));
    assert!(stdout.contains("type \"#user\", \"alice\""));
    assert!(stdout.contains("# failed: Element not found: #missing\nclick \"#missing\""));
    assert!(stdout.contains("wait for \"#dashboard\" timeout 3000"));
    assert!(stdout.contains("extract \"h1\" as extracted_1"));
    assert!(stdout.contains("log \"Retrying after \\{failure\\}\""));
    assert!(stdout.contains("# assert passed: landed on dashboard"));
    assert!(stdout.contains("screenshot \"done\""));
    assert!(!stdout.contains("StartSession"));
    assert!(!stdout.contains("EndSession"));
}

#[test]
fn test_convert_writes_output_file_that_checks() {
    let fixture = fixture_path("session.jsonl");
    let output = std::env::temp_dir().join(format!("trellis-convert-{}.trl", std::process::id()));

    trellis()
        .args(["convert", fixture.to_str().unwrap(), "--output", output.to_str().unwrap()])
        .assert()
        .success()
        .stderr(predicate::str::contains("Wrote"));

    trellis()
        .args(["check", output.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains(": ok"));
    let _ = std::fs::remove_file(output);
}

#[test]
fn test_convert_from_stdin() {
    trellis()
        .arg("convert")
        .write_stdin("{\"id\":\"0b0e1a52-7c1d-4d0f-9a51-3b1f6f0c0001\",\"timestamp\":\"2024-05-01T09:00:00Z\",\"action\":{\"type\":\"Wait\",\"ms\":250},\"result\":\"Success\"}\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("wait 250"));
}

#[test]
fn test_convert_nonexistent_file() {
    trellis()
        .args(["convert", "nonexistent_file_that_does_not_exist.jsonl"])
        .assert()
        .failure();
}

#[test]
fn test_completions() {
    trellis()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("trellis"));
}

#[test]
fn test_unknown_subcommand() {
    trellis()
        .arg("totally-fake-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}
