//! Action execution against an automation backend.
//!
//! [`ActionExecutor`] turns one [`ActionType`] into calls on an
//! [`AutomationDriver`] and reports the outcome as an [`ExecutionResult`].
//! The interpreter builds the action from an automation statement, hands it
//! here and raises an execution error when the result is a failure.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_core::action::ActionType;
//! use trellis_core::executor::ActionExecutor;
//! use trellis_core::recording_driver::RecordingDriver;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = ActionExecutor::new(Arc::new(RecordingDriver::new()));
//!
//!     let result = executor.execute(ActionType::Click {
//!         selector: "#login".to_string(),
//!     }).await;
//!
//!     if result.success {
//!         println!("Clicked!");
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, Instrument};

use crate::action::ActionType;
use crate::driver::AutomationDriver;

/// Result of executing an action.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the action completed successfully.
    pub success: bool,
    /// Human-readable description of the result.
    pub message: String,
    /// Data returned by the action (extracted text, screenshot location).
    pub data: Option<String>,
    /// Wall-clock time the action took.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Creates a successful result with a message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            duration_ms: 0,
        }
    }

    /// Creates a failure result with an error message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            duration_ms: 0,
        }
    }

    /// Adds data to the result.
    pub fn with_data(mut self, data: String) -> Self {
        self.data = Some(data);
        self
    }
}

/// Executes automation actions through an [`AutomationDriver`].
pub struct ActionExecutor {
    driver: Arc<dyn AutomationDriver>,
}

impl ActionExecutor {
    pub fn new(driver: Arc<dyn AutomationDriver>) -> Self {
        Self { driver }
    }

    /// Returns a reference to the underlying driver.
    pub fn driver(&self) -> &Arc<dyn AutomationDriver> {
        &self.driver
    }

    /// Executes an action and returns the result.
    ///
    /// Session markers, `LogComment` and `Assert` never reach the driver and
    /// always succeed.
    pub async fn execute(&self, action: ActionType) -> ExecutionResult {
        let action_name = action.name();
        let span = info_span!("execute_action", action = action_name);
        async {
            let start = Instant::now();
            let mut result = self.execute_inner(action).await;
            result.duration_ms = start.elapsed().as_millis() as u64;
            debug!(elapsed_ms = result.duration_ms, success = result.success, "action complete");
            result
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(&self, action: ActionType) -> ExecutionResult {
        if !action.is_driver_action() {
            return match action {
                ActionType::LogComment { message } => ExecutionResult::success(format!("Logged: {}", message)),
                ActionType::Assert { passed: true, .. } => ExecutionResult::success("Assertion passed"),
                ActionType::Assert { message, .. } => {
                    ExecutionResult::failure(message.unwrap_or_else(|| "Assertion failed".to_string()))
                }
                _ => ExecutionResult::success("OK"),
            };
        }
        if !self.driver.is_connected() {
            return ExecutionResult::failure("Not connected to automation backend");
        }

        match action {
            ActionType::Navigate { ref url } => match self.driver.navigate(url).await {
                Ok(page) => ExecutionResult::success(format!("Navigated to '{}'", page.url)),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            ActionType::Click { ref selector } => match self.driver.click(selector).await {
                Ok(_) => ExecutionResult::success(format!("Clicked '{}'", selector)),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            ActionType::Type { ref selector, ref text } => match self.driver.type_text(selector, text).await {
                Ok(_) => ExecutionResult::success(format!("Typed '{}' into '{}'", text, selector)),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            ActionType::Select { ref selector, ref value } => {
                match self.driver.select_option(selector, value).await {
                    Ok(_) => ExecutionResult::success(format!("Selected '{}' in '{}'", value, selector)),
                    Err(e) => ExecutionResult::failure(e.to_string()),
                }
            }

            ActionType::Hover { ref selector } => match self.driver.hover(selector).await {
                Ok(_) => ExecutionResult::success(format!("Hovered '{}'", selector)),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            ActionType::Wait { ms } => match self.driver.wait(ms).await {
                Ok(_) => ExecutionResult::success(format!("Waited {}ms", ms)),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            ActionType::WaitFor { ref selector, timeout_ms } => {
                match self.driver.wait_for(selector, timeout_ms).await {
                    Ok(_) => ExecutionResult::success(format!("Element '{}' found", selector)),
                    Err(e) => ExecutionResult::failure(format!("Waiting for '{}': {}", selector, e)),
                }
            }

            ActionType::Extract { ref selector } => match self.driver.extract_text(selector).await {
                Ok(text) => ExecutionResult::success(format!("Extracted '{}'", selector)).with_data(text),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            ActionType::Screenshot { ref name } => match self.driver.screenshot(name.as_deref()).await {
                Ok(location) => ExecutionResult::success("Screenshot captured").with_data(location),
                Err(e) => ExecutionResult::failure(e.to_string()),
            },

            // Handled above.
            ActionType::LogComment { .. } | ActionType::Assert { .. } | ActionType::StartSession | ActionType::EndSession => {
                ExecutionResult::success("OK")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording_driver::RecordingDriver;

    #[test]
    fn test_execution_result_success() {
        let result = ExecutionResult::success("test message");
        assert!(result.success);
        assert_eq!(result.message, "test message");
        assert!(result.data.is_none());
    }

    #[test]
    fn test_execution_result_failure() {
        let result = ExecutionResult::failure("error message");
        assert!(!result.success);
        assert_eq!(result.message, "error message");
    }

    #[test]
    fn test_execution_result_with_data() {
        let result = ExecutionResult::success("ok").with_data("Dashboard".to_string());
        assert_eq!(result.data, Some("Dashboard".to_string()));
    }

    #[tokio::test]
    async fn test_extract_returns_data() {
        let driver = Arc::new(RecordingDriver::new().with_text("h1", "Welcome"));
        let executor = ActionExecutor::new(driver);
        let result = executor.execute(ActionType::Extract { selector: "h1".to_string() }).await;
        assert!(result.success);
        assert_eq!(result.data.as_deref(), Some("Welcome"));
    }

    #[tokio::test]
    async fn test_driver_failure_is_reported() {
        let driver = Arc::new(RecordingDriver::new().with_missing("#nope"));
        let executor = ActionExecutor::new(driver);
        let result = executor.execute(ActionType::Click { selector: "#nope".to_string() }).await;
        assert!(!result.success);
        assert!(result.message.contains("#nope"));
    }

    #[tokio::test]
    async fn test_log_comment_skips_driver() {
        let driver = Arc::new(RecordingDriver::new());
        let executor = ActionExecutor::new(driver.clone());
        let result = executor
            .execute(ActionType::LogComment { message: "hello".to_string() })
            .await;
        assert!(result.success);
        assert!(driver.recorded().await.is_empty());
    }
}
