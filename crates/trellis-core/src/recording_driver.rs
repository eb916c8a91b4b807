//! Dry-run automation backend.
//!
//! [`RecordingDriver`] performs no browser work. It records every call,
//! keeps a simulated page (URL and title follow the last `navigate`) and
//! answers `extract` from a table of canned selector texts. Selectors marked
//! missing fail the way a real backend would.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::action::ActionType;
use crate::driver::{AutomationDriver, DriverError, PageState};

#[derive(Debug, Default)]
pub struct RecordingDriver {
    texts: HashMap<String, String>,
    titles: HashMap<String, String>,
    missing: HashSet<String>,
    page: Mutex<PageState>,
    recorded: Mutex<Vec<ActionType>>,
    screenshots: Mutex<usize>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text returned by `extract` for `selector`.
    pub fn with_text(mut self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.texts.insert(selector.into(), text.into());
        self
    }

    /// Page title reported after navigating to `url`.
    pub fn with_title(mut self, url: impl Into<String>, title: impl Into<String>) -> Self {
        self.titles.insert(url.into(), title.into());
        self
    }

    /// Makes every action on `selector` fail with "element not found".
    pub fn with_missing(mut self, selector: impl Into<String>) -> Self {
        self.missing.insert(selector.into());
        self
    }

    /// Everything the driver was asked to do, in order.
    pub async fn recorded(&self) -> Vec<ActionType> {
        self.recorded.lock().await.clone()
    }

    async fn record(&self, action: ActionType) {
        self.recorded.lock().await.push(action);
    }

    fn find(&self, selector: &str) -> Result<(), DriverError> {
        if self.missing.contains(selector) {
            Err(DriverError::ElementNotFound(selector.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AutomationDriver for RecordingDriver {
    fn is_connected(&self) -> bool {
        true
    }

    async fn navigate(&self, url: &str) -> Result<PageState, DriverError> {
        self.record(ActionType::Navigate { url: url.to_string() }).await;
        let state = PageState {
            url: url.to_string(),
            title: self.titles.get(url).cloned().unwrap_or_default(),
        };
        *self.page.lock().await = state.clone();
        Ok(state)
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.record(ActionType::Click { selector: selector.to_string() }).await;
        self.find(selector)
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        self.record(ActionType::Type {
            selector: selector.to_string(),
            text: text.to_string(),
        })
        .await;
        self.find(selector)
    }

    async fn select_option(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        self.record(ActionType::Select {
            selector: selector.to_string(),
            value: value.to_string(),
        })
        .await;
        self.find(selector)
    }

    async fn hover(&self, selector: &str) -> Result<(), DriverError> {
        self.record(ActionType::Hover { selector: selector.to_string() }).await;
        self.find(selector)
    }

    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<(), DriverError> {
        self.record(ActionType::WaitFor {
            selector: selector.to_string(),
            timeout_ms,
        })
        .await;
        if self.missing.contains(selector) {
            return Err(DriverError::Timeout(timeout_ms));
        }
        Ok(())
    }

    async fn extract_text(&self, selector: &str) -> Result<String, DriverError> {
        self.record(ActionType::Extract { selector: selector.to_string() }).await;
        self.find(selector)?;
        Ok(self.texts.get(selector).cloned().unwrap_or_default())
    }

    async fn screenshot(&self, name: Option<&str>) -> Result<String, DriverError> {
        self.record(ActionType::Screenshot { name: name.map(str::to_string) }).await;
        let mut count = self.screenshots.lock().await;
        *count += 1;
        Ok(match name {
            Some(name) => format!("{}.png", name),
            None => format!("screenshot-{}.png", *count),
        })
    }

    async fn page(&self) -> Result<PageState, DriverError> {
        Ok(self.page.lock().await.clone())
    }

    async fn wait(&self, ms: u64) -> Result<(), DriverError> {
        self.record(ActionType::Wait { ms }).await;
        Ok(())
    }
}
