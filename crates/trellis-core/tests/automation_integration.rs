//! Automation statements against the recording driver, and the session log
//! they leave behind.

mod common;

use std::sync::Arc;

use trellis_core::action::{ActionLog, ActionResult, ActionType};
use trellis_core::config::TrellisConfig;
use trellis_core::error::{ExecutionErrorKind, TrellisError};
use trellis_core::interpreter::Interpreter;
use trellis_core::recording_driver::RecordingDriver;
use trellis_core::session::Session;
use trellis_core::value::Value;

fn actions(log: &[ActionLog]) -> Vec<ActionType> {
    log.iter().map(|entry| entry.action.clone()).collect()
}

#[tokio::test]
async fn test_login_flow_reaches_driver_in_order() {
    let driver = Arc::new(
        RecordingDriver::new()
            .with_title("http://app.test/login", "Login")
            .with_text("h1", "Dashboard"),
    );
    let source = "\
const BASE = \"http://app.test\"
step \"Login\":
    navigate BASE + \"/login\"
    type \"#user\", \"alice\"
    click \"button[type=submit]\"
    wait for \"#dashboard\" timeout 3000
    extract \"h1\" as heading
    assert heading == \"Dashboard\", \"landed on dashboard\"
log \"title: {page.title}\"
";
    let report = Interpreter::new(driver.clone()).run_source(source).await.unwrap();

    assert_eq!(
        driver.recorded().await,
        vec![
            ActionType::Navigate { url: "http://app.test/login".to_string() },
            ActionType::Type { selector: "#user".to_string(), text: "alice".to_string() },
            ActionType::Click { selector: "button[type=submit]".to_string() },
            ActionType::WaitFor { selector: "#dashboard".to_string(), timeout_ms: 3000 },
            ActionType::Extract { selector: "h1".to_string() },
        ]
    );
    assert_eq!(report.logs, vec!["title: Login"]);
}

#[tokio::test]
async fn test_session_log_records_every_statement() {
    let driver = Arc::new(RecordingDriver::new());
    let source = "navigate \"http://x.test\"\nlog \"hi\"\nassert true\nscreenshot \"home\"";
    let report = Interpreter::new(driver).run_source(source).await.unwrap();

    assert_eq!(
        actions(&report.actions),
        vec![
            ActionType::StartSession,
            ActionType::Navigate { url: "http://x.test".to_string() },
            ActionType::LogComment { message: "hi".to_string() },
            ActionType::Assert { passed: true, message: None },
            ActionType::Screenshot { name: Some("home".to_string()) },
            ActionType::EndSession,
        ]
    );
    assert!(report.actions.iter().all(|entry| entry.result == ActionResult::Success));
}

#[tokio::test]
async fn test_failed_assertion_is_logged_then_raised() {
    let driver = Arc::new(RecordingDriver::new());
    let mut interpreter = Interpreter::new(driver);
    let result = interpreter.run_source("let n = 1\nassert n > 1, \"n is large\"\nlog \"never\"").await;
    match result {
        Err(TrellisError::Execution(e)) => {
            assert_eq!(e.kind, ExecutionErrorKind::Assertion);
            assert_eq!(e.line, 2);
            assert_eq!(e.message, "Assertion failed: n is large");
        }
        other => panic!("Expected assertion failure, got {:?}", other.map(|r| r.logs)),
    }

    let log = interpreter.session().get_action_log().await;
    assert!(log.iter().any(|entry| entry.action
        == ActionType::Assert { passed: false, message: Some("n is large".to_string()) }));
    let end = log.last().unwrap();
    assert_eq!(end.action, ActionType::EndSession);
    assert!(matches!(&end.result, ActionResult::Failure(msg) if msg.contains("RT-005")));
    assert!(!log.iter().any(|entry| entry.action == ActionType::LogComment { message: "never".to_string() }));
}

#[tokio::test]
async fn test_missing_element_is_action_error() {
    let driver = Arc::new(RecordingDriver::new().with_missing("#gone"));
    let result = Interpreter::new(driver).run_source("log \"a\"\nclick \"#gone\"").await;
    match result {
        Err(TrellisError::Execution(e)) => {
            assert_eq!(e.kind, ExecutionErrorKind::Action);
            assert_eq!(e.line, 2);
            assert!(e.message.contains("#gone"));
        }
        other => panic!("Expected action failure, got {:?}", other.map(|r| r.logs)),
    }
}

#[tokio::test]
async fn test_wait_for_uses_configured_default_timeout() {
    let driver = Arc::new(RecordingDriver::new());
    let config = TrellisConfig {
        default_timeout_ms: 1234,
        ..TrellisConfig::default()
    };
    Interpreter::new(driver.clone())
        .with_config(config)
        .run_source("wait for \"#spinner\"")
        .await
        .unwrap();
    assert_eq!(
        driver.recorded().await,
        vec![ActionType::WaitFor { selector: "#spinner".to_string(), timeout_ms: 1234 }]
    );
}

#[tokio::test]
async fn test_relative_navigation_uses_base_url() {
    let driver = Arc::new(RecordingDriver::new());
    let config = TrellisConfig {
        base_url: Some("http://app.test/".to_string()),
        ..TrellisConfig::default()
    };
    let report = Interpreter::new(driver)
        .with_config(config)
        .run_source("navigate \"/settings\"\nlet url = page.url\nlet base = config.base_url")
        .await
        .unwrap();
    assert_eq!(report.global("url"), Some(&Value::string("http://app.test/settings")));
    assert_eq!(report.global("base"), Some(&Value::string("http://app.test/")));
}

#[tokio::test]
async fn test_extract_reuses_local_binding() {
    let driver = Arc::new(RecordingDriver::new().with_text(".count", "42"));
    let source = "let count = \"\"\nextract \".count\" as count\nlet n = int(count)";
    let report = Interpreter::new(driver).run_source(source).await.unwrap();
    assert_eq!(report.global("count"), Some(&Value::string("42")));
    assert_eq!(report.global("n"), Some(&Value::Integer(42)));
}

#[tokio::test]
async fn test_context_env_and_browser() {
    let driver = Arc::new(RecordingDriver::new());
    let source = "\
let script = context.script
let outside = context.step
let inside = null
step \"checkout\":
    inside = context.step
let token = env.TRELLIS_TEST_TOKEN
let unset = env.TRELLIS_SURELY_UNSET_VARIABLE
let browser_name = browser.name
";
    let report = Interpreter::new(driver)
        .with_script(std::path::Path::new("flows/checkout.trl"))
        .with_env("TRELLIS_TEST_TOKEN", "abc")
        .run_source(source)
        .await
        .unwrap();
    assert_eq!(report.global("script"), Some(&Value::string("checkout")));
    assert_eq!(report.global("outside"), Some(&Value::Null));
    assert_eq!(report.global("inside"), Some(&Value::string("checkout")));
    assert_eq!(report.global("token"), Some(&Value::string("abc")));
    assert_eq!(report.global("unset"), Some(&Value::Null));
    assert_eq!(report.global("browser_name"), Some(&Value::string("chromium")));
}

#[tokio::test]
async fn test_unknown_system_attribute() {
    let driver = Arc::new(RecordingDriver::new());
    let result = Interpreter::new(driver).run_source("let x = page.nope").await;
    match result {
        Err(TrellisError::Execution(e)) => assert_eq!(e.kind, ExecutionErrorKind::UndefinedName),
        other => panic!("Expected failure, got {:?}", other.map(|r| r.logs)),
    }
}

#[tokio::test]
async fn test_session_log_file_is_json_lines() {
    let dir = std::env::temp_dir().join(format!("trellis-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let session = Session::new("file log", Some(&dir));
    let path = session.log_path().unwrap().to_path_buf();

    Interpreter::new(Arc::new(RecordingDriver::new()))
        .with_session(session)
        .run_source("navigate \"http://x.test\"\nlog \"done\"")
        .await
        .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<ActionLog> = text.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[1].action, ActionType::Navigate { url: "http://x.test".to_string() });
    std::fs::remove_dir_all(&dir).ok();
}
