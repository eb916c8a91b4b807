//! Automation driver trait for backend-agnostic browser automation.
//!
//! This module defines the [`AutomationDriver`] trait, the only thing the
//! interpreter knows about a browser. A real backend (a WebDriver or CDP
//! client) implements it out of tree; [`RecordingDriver`](crate::recording_driver::RecordingDriver)
//! is the in-tree dry-run backend used by the CLI and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during automation driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// No element matched the selector.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// A command or operation failed with the given message.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The backend is not available or not connected.
    #[error("Not connected to automation backend")]
    NotConnected,

    /// An operation timed out.
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of the current page, exposed to scripts as `page`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
}

/// Trait for browser automation backends.
///
/// Selectors are opaque strings (CSS selectors for most backends). Every
/// method is awaited to completion before the script continues.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Check if the backend is ready to accept commands.
    fn is_connected(&self) -> bool;

    /// Load `url` and return the resulting page state.
    async fn navigate(&self, url: &str) -> Result<PageState, DriverError>;

    /// Click the element matching `selector`.
    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    /// Type `text` into the element matching `selector`.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError>;

    /// Choose `value` in the `<select>` matching `selector`.
    async fn select_option(&self, selector: &str, value: &str) -> Result<(), DriverError>;

    /// Move the pointer over the element matching `selector`.
    async fn hover(&self, selector: &str) -> Result<(), DriverError>;

    /// Wait until an element matching `selector` is present.
    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<(), DriverError>;

    /// Text content of the first element matching `selector`.
    async fn extract_text(&self, selector: &str) -> Result<String, DriverError>;

    /// Capture a screenshot and return where it was stored.
    async fn screenshot(&self, name: Option<&str>) -> Result<String, DriverError>;

    /// The current page.
    async fn page(&self) -> Result<PageState, DriverError>;

    /// Pause for `ms` milliseconds.
    ///
    /// The default implementation sleeps on the tokio timer.
    async fn wait(&self, ms: u64) -> Result<(), DriverError> {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(())
    }
}
