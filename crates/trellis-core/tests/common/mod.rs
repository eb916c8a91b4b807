//! Shared test helpers for trellis-core integration tests.
//!
//! Provides a canned HTTP transport that records every request, helpers for
//! building interpreters around a [`RecordingDriver`], and a `run_script`
//! shortcut for the common "parse, run, inspect globals" case.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use trellis_core::error::{ExecutionError, TrellisError};
use trellis_core::http::{HttpRequest, HttpResponse, HttpTransport};
use trellis_core::interpreter::{ExecutionReport, Interpreter};
use trellis_core::provider::ProviderError;
use trellis_core::recording_driver::RecordingDriver;

// ---------------------------------------------------------------------------
// Mock HTTP transport
// ---------------------------------------------------------------------------

/// Answers requests from a list of `(method, url substring, response)` routes.
/// Unmatched requests get a 404 with an empty body.
#[derive(Default)]
pub struct MockTransport {
    routes: Vec<(String, String, HttpResponse)>,
    sent: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: &str, url_contains: &str, response: HttpResponse) -> Self {
        self.routes
            .push((method.to_string(), url_contains.to_string(), response));
        self
    }

    /// Shortcut for a 200 JSON response.
    pub fn json(self, method: &str, url_contains: &str, body: serde_json::Value) -> Self {
        let response =
            HttpResponse::new(200, body.to_string()).with_header("Content-Type", "application/json");
        self.route(method, url_contains, response)
    }

    pub async fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        let response = self
            .routes
            .iter()
            .find(|(method, fragment, _)| method == &request.method && request.url.contains(fragment.as_str()))
            .map(|(_, _, response)| response.clone())
            .unwrap_or_else(|| HttpResponse::new(404, ""));
        self.sent.lock().await.push(request);
        Ok(response)
    }
}

/// A transport whose every request fails at the network level.
pub struct FailingTransport;

#[async_trait]
impl HttpTransport for FailingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        Err(ProviderError::Transport(format!("connection refused: {}", request.url)))
    }
}

// ---------------------------------------------------------------------------
// Interpreter helpers
// ---------------------------------------------------------------------------

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

pub fn interpreter() -> Interpreter {
    Interpreter::new(Arc::new(RecordingDriver::new()))
}

/// Interpreter with `transport` behind `http` and imports resolved
/// relative to the fixtures directory.
pub fn interpreter_with_http(transport: Arc<MockTransport>) -> Interpreter {
    interpreter()
        .with_http(transport)
        .with_script(&fixture("script.trl"))
}

pub async fn run_script(source: &str) -> Result<ExecutionReport, TrellisError> {
    interpreter().run_source(source).await
}

/// Runs `source` and returns the runtime error it must fail with.
pub async fn run_failing(source: &str) -> ExecutionError {
    match run_script(source).await {
        Err(TrellisError::Execution(e)) => e,
        Err(other) => panic!("Expected an execution error, got {}", other),
        Ok(report) => panic!("Expected failure, script succeeded with logs {:?}", report.logs),
    }
}
