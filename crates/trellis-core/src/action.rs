//! Action types and logging for automation operations.
//!
//! Every automation statement in a script becomes one [`ActionType`] that is
//! handed to the [`ActionExecutor`](crate::executor::ActionExecutor). Each
//! executed action (plus each `log` line and `assert`) is recorded as an
//! [`ActionLog`] in the [`Session`](crate::session::Session).
//!
//! # Action Types
//!
//! - **Navigation**: [`ActionType::Navigate`]
//! - **UI Interaction**: [`ActionType::Click`], [`ActionType::Type`], [`ActionType::Select`], [`ActionType::Hover`]
//! - **Waiting**: [`ActionType::Wait`], [`ActionType::WaitFor`]
//! - **Information Retrieval**: [`ActionType::Extract`], [`ActionType::Screenshot`]
//! - **Session Management**: [`ActionType::StartSession`], [`ActionType::EndSession`]
//! - **Script Output**: [`ActionType::LogComment`], [`ActionType::Assert`]
//!
//! # Example
//!
//! ```
//! use trellis_core::action::{ActionType, ActionResult, ActionLog};
//!
//! let action = ActionType::Click {
//!     selector: "#login".to_string(),
//! };
//!
//! let log = ActionLog::new(action, ActionResult::Success, None);
//! println!("Action {} at {}", log.id, log.timestamp);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The result of executing an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionResult {
    /// The action completed successfully.
    Success,

    /// The action failed with the given error message.
    Failure(String),
}

/// Types of actions that can be performed against a browser.
///
/// Actions are serialized as JSON with a `type` tag discriminator, which is
/// also the format of the session log files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionType {
    /// Load a URL in the current page.
    Navigate {
        url: String,
    },

    /// Click the element matching a CSS selector.
    Click {
        selector: String,
    },

    /// Type text into the element matching a selector.
    Type {
        selector: String,
        text: String,
    },

    /// Choose an option of a `<select>` element.
    Select {
        selector: String,
        value: String,
    },

    /// Move the pointer over an element.
    Hover {
        selector: String,
    },

    /// Pause for a fixed duration.
    Wait {
        ms: u64,
    },

    /// Wait for an element to appear.
    WaitFor {
        selector: String,
        /// Maximum time to wait in milliseconds.
        timeout_ms: u64,
    },

    /// Read the text content of an element.
    Extract {
        selector: String,
    },

    /// Capture a screenshot, optionally under a given name.
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Output of a `log` statement.
    LogComment {
        message: String,
    },

    /// Outcome of an `assert` statement.
    Assert {
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Start of a script run.
    StartSession,

    /// End of a script run.
    EndSession,
}

impl ActionType {
    /// Returns a short, static name for this action type suitable for use in
    /// tracing span metadata.
    pub fn name(&self) -> &'static str {
        match self {
            ActionType::Navigate { .. } => "navigate",
            ActionType::Click { .. } => "click",
            ActionType::Type { .. } => "type",
            ActionType::Select { .. } => "select",
            ActionType::Hover { .. } => "hover",
            ActionType::Wait { .. } => "wait",
            ActionType::WaitFor { .. } => "wait_for",
            ActionType::Extract { .. } => "extract",
            ActionType::Screenshot { .. } => "screenshot",
            ActionType::LogComment { .. } => "log_comment",
            ActionType::Assert { .. } => "assert",
            ActionType::StartSession => "start_session",
            ActionType::EndSession => "end_session",
        }
    }

    /// Whether this action is forwarded to the automation driver.
    pub fn is_driver_action(&self) -> bool {
        !matches!(
            self,
            ActionType::LogComment { .. }
                | ActionType::Assert { .. }
                | ActionType::StartSession
                | ActionType::EndSession
        )
    }
}

/// A logged action with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    /// Unique identifier for this log entry.
    pub id: Uuid,

    /// When the action was executed.
    pub timestamp: DateTime<Utc>,

    /// The action that was performed.
    pub action: ActionType,

    /// The result of the action.
    pub result: ActionResult,

    /// How long the action took in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ActionLog {
    /// Creates a new entry with a fresh UUID and the current time.
    pub fn new(action: ActionType, result: ActionResult, duration_ms: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            result,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serializes_with_type_tag() {
        let action = ActionType::Type {
            selector: "#user".to_string(),
            text: "alice".to_string(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "Type");
        assert_eq!(json["selector"], "#user");
        assert_eq!(json["text"], "alice");
    }

    #[test]
    fn test_screenshot_name_is_optional() {
        let parsed: ActionType = serde_json::from_str(r#"{"type":"Screenshot"}"#).unwrap();
        assert_eq!(parsed, ActionType::Screenshot { name: None });
    }

    #[test]
    fn test_action_log_roundtrip() {
        let log = ActionLog::new(
            ActionType::WaitFor {
                selector: "#dash".to_string(),
                timeout_ms: 3000,
            },
            ActionResult::Failure("timed out".to_string()),
            Some(3001),
        );
        let json = serde_json::to_string(&log).unwrap();
        let back: ActionLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, log.id);
        assert_eq!(back.action, log.action);
        assert_eq!(back.result, ActionResult::Failure("timed out".to_string()));
        assert_eq!(back.duration_ms, Some(3001));
    }

    #[test]
    fn test_driver_actions() {
        assert!(ActionType::Navigate { url: "x".into() }.is_driver_action());
        assert!(!ActionType::LogComment { message: "x".into() }.is_driver_action());
        assert!(!ActionType::StartSession.is_driver_action());
        assert_eq!(ActionType::WaitFor { selector: "a".into(), timeout_ms: 1 }.name(), "wait_for");
    }
}
