//! The `http` namespace and the transport it is built on.
//!
//! [`HttpTransport`] is the network seam: the CLI plugs in a plain TCP
//! client, tests plug in a canned one. [`HttpProvider`] turns script calls
//! such as `http.get("/pets", query: {limit: 3})` into [`HttpRequest`]s and
//! every reply into a response object:
//!
//! ```text
//! {success, status, data, text, error, headers}
//! ```
//!
//! A non-2xx reply is still a value (`success` false, `error` set). Only
//! transport failures and timeouts are provider errors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::provider::{CallArgs, ProviderError, ServiceProvider};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The response object scripts see.
    pub fn to_value(&self) -> Value {
        let data = serde_json::from_str::<serde_json::Value>(&self.body)
            .map(|json| Value::from_json(&json))
            .unwrap_or(Value::Null);
        let error = if self.is_success() {
            Value::Null
        } else {
            Value::String(format!("HTTP {}", self.status))
        };
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), Value::String(v.clone())))
            .collect();

        let mut map = BTreeMap::new();
        map.insert("success".to_string(), Value::Bool(self.is_success()));
        map.insert("status".to_string(), Value::Integer(self.status as i64));
        map.insert("data".to_string(), data);
        map.insert("text".to_string(), Value::String(self.body.clone()));
        map.insert("error".to_string(), error);
        map.insert("headers".to_string(), Value::Object(headers));
        Value::Object(map)
    }
}

/// Sends one request and returns the raw reply.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError>;
}

/// Sends `request`, failing with [`ProviderError::Timeout`] once its
/// timeout elapses.
pub(crate) async fn send_with_timeout(
    transport: &dyn HttpTransport,
    request: HttpRequest,
) -> Result<HttpResponse, ProviderError> {
    let timeout_ms = request.timeout_ms;
    tracing::debug!(method = %request.method, url = %request.url, timeout_ms, "http request");
    match tokio::time::timeout(Duration::from_millis(timeout_ms), transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout_ms)),
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
pub fn encode_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Appends `query` (an object) to `url`.
pub(crate) fn append_query(url: &str, query: Option<&Value>) -> Result<String, ProviderError> {
    let pairs = match query {
        None | Some(Value::Null) => return Ok(url.to_string()),
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Null))
            .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(&v.as_text())))
            .collect::<Vec<_>>(),
        Some(other) => {
            return Err(ProviderError::InvalidArguments(format!(
                "query must be an object, got {}",
                other.type_name()
            )))
        }
    };
    if pairs.is_empty() {
        return Ok(url.to_string());
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", url, sep, pairs.join("&")))
}

/// Reads a `headers` object into name/value pairs.
pub(crate) fn header_pairs(headers: Option<&Value>) -> Result<Vec<(String, String)>, ProviderError> {
    match headers {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map.iter().map(|(k, v)| (k.clone(), v.as_text())).collect()),
        Some(other) => Err(ProviderError::InvalidArguments(format!(
            "headers must be an object, got {}",
            other.type_name()
        ))),
    }
}

/// Serializes a request body. Strings are sent as-is, anything else as JSON.
pub(crate) fn encode_body(body: Option<&Value>, headers: &mut Vec<(String, String)>) -> Option<String> {
    let body = match body {
        None | Some(Value::Null) => return None,
        Some(Value::String(text)) => text.clone(),
        Some(other) => {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            other.to_json().to_string()
        }
    };
    Some(body)
}

pub(crate) fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

const METHODS: [&str; 6] = ["get", "post", "put", "patch", "delete", "request"];

/// Named arguments every `http` method accepts.
const OPTIONS: [&str; 4] = ["headers", "query", "timeout", "body"];

pub struct HttpProvider {
    transport: Arc<dyn HttpTransport>,
    base_url: Option<String>,
    timeout_ms: u64,
}

impl HttpProvider {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: Option<String>, timeout_ms: u64) -> Self {
        Self {
            transport,
            base_url,
            timeout_ms,
        }
    }

    fn resolve_url(&self, url: &str) -> Result<String, ProviderError> {
        if is_absolute(url) {
            return Ok(url.to_string());
        }
        match &self.base_url {
            Some(base) => Ok(join_url(base, url)),
            None => Err(ProviderError::Configuration(format!(
                "relative URL '{}' needs a base_url",
                url
            ))),
        }
    }

    fn build_request(&self, method: &str, args: &CallArgs) -> Result<HttpRequest, ProviderError> {
        // `request(method, url, body)` shifts the other methods' arguments by one.
        let (verb, offset) = if method == "request" {
            (args.require_str(0, "method")?.to_ascii_uppercase(), 1)
        } else {
            (method.to_ascii_uppercase(), 0)
        };
        if let Some(unknown) = args
            .named
            .keys()
            .find(|k| !OPTIONS.contains(&k.as_str()) && !(offset == 1 && k.as_str() == "method") && k.as_str() != "url")
        {
            return Err(ProviderError::InvalidArguments(format!("unknown option '{}'", unknown)));
        }

        let url = self.resolve_url(args.require_str(offset, "url")?)?;
        let url = append_query(&url, args.named("query"))?;
        let mut headers = header_pairs(args.named("headers"))?;
        let body = encode_body(args.get(offset + 1, "body"), &mut headers);
        let timeout_ms = match args.named("timeout") {
            Some(value) => value
                .as_i64()
                .filter(|ms| *ms > 0)
                .map(|ms| ms as u64)
                .ok_or_else(|| ProviderError::InvalidArguments("timeout must be a positive integer".to_string()))?,
            None => self.timeout_ms,
        };

        Ok(HttpRequest {
            method: verb,
            url,
            headers,
            body,
            timeout_ms,
        })
    }
}

#[async_trait]
impl ServiceProvider for HttpProvider {
    fn namespace(&self) -> &str {
        "http"
    }

    fn methods(&self) -> Vec<String> {
        METHODS.iter().map(|m| m.to_string()).collect()
    }

    async fn invoke(&self, method: &str, args: CallArgs) -> Result<Value, ProviderError> {
        let request = self.build_request(method, &args)?;
        let response = send_with_timeout(self.transport.as_ref(), request).await?;
        Ok(response.to_value())
    }

    fn records_response(&self) -> bool {
        true
    }
}
