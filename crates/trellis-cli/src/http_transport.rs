//! HTTP transport backed by a shared `ureq` agent.
//!
//! `ureq` is blocking, so each request runs on tokio's blocking pool. TLS
//! comes from ureq's rustls backend, so `https://` works out of the box.
//! Non-2xx statuses are responses, not errors.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use trellis_core::http::{HttpRequest, HttpResponse, HttpTransport};
use trellis_core::provider::ProviderError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .user_agent(concat!("trellis/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Header names and values end up verbatim on the wire, so line breaks
/// would let a script smuggle in extra headers.
fn check_headers(headers: &[(String, String)]) -> Result<(), ProviderError> {
    for (name, value) in headers {
        if name.is_empty() || name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
            return Err(ProviderError::InvalidArguments(format!(
                "invalid header '{}': names and values must not contain line breaks",
                name.escape_debug()
            )));
        }
    }
    Ok(())
}

fn into_response(response: ureq::Response) -> Result<HttpResponse, ProviderError> {
    let status = response.status();
    let headers = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            let value = response.header(&name)?.to_string();
            Some((name, value))
        })
        .collect();
    let body = response
        .into_string()
        .map_err(|e| ProviderError::Transport(format!("cannot read response body: {}", e)))?;
    Ok(HttpResponse { status, headers, body })
}

fn send_blocking(agent: &ureq::Agent, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
    let mut call = agent
        .request(&request.method, &request.url)
        .timeout(Duration::from_millis(request.timeout_ms));
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let sent = match &request.body {
        Some(body) => call.send_string(body),
        None => call.call(),
    };
    match sent {
        Ok(response) => into_response(response),
        Err(ureq::Error::Status(_, response)) => into_response(response),
        Err(ureq::Error::Transport(transport)) => match transport.kind() {
            ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
                Err(ProviderError::Configuration(format!("{}: {}", request.url, transport)))
            }
            _ => Err(ProviderError::Transport(transport.to_string())),
        },
    }
}

#[async_trait]
impl HttpTransport for UreqTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
        check_headers(&request.headers)?;
        debug!(method = %request.method, url = %request.url, "sending");

        let agent = self.agent.clone();
        let response = tokio::task::spawn_blocking(move || send_blocking(&agent, request))
            .await
            .map_err(|e| ProviderError::Failed(format!("http worker stopped: {}", e)))??;
        debug!(status = response.status, bytes = response.body.len(), "response received");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn request(method: &str, url: &str, body: Option<&str>) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            url: url.to_string(),
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: body.map(str::to_string),
            timeout_ms: 2000,
        }
    }

    /// Answers one request with `reply` and hands back what it received.
    fn serve_once(reply: &'static str) -> (u16, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            socket.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&seen).into_owned()
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let (port, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 12\r\n\r\n{\"ok\": true}");

        let url = format!("http://127.0.0.1:{}/health", port);
        let response = UreqTransport::new().send(request("GET", &url, None)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{\"ok\": true}");
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v == "application/json"));

        let seen = server.join().unwrap();
        assert!(seen.starts_with("GET /health HTTP/1.1\r\n"));
        assert!(seen.to_ascii_lowercase().contains("accept: application/json\r\n"));
        assert!(seen.contains("trellis/"));
    }

    #[tokio::test]
    async fn test_error_status_is_a_response() {
        let (port, server) = serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\nnope");

        let url = format!("http://127.0.0.1:{}/pets/9", port);
        let response = UreqTransport::new().send(request("GET", &url, None)).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body, "nope");
        assert!(!response.is_success());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_header_line_breaks_are_rejected() {
        let mut req = request("GET", "http://127.0.0.1:9/", None);
        req.headers.push(("X-Name".to_string(), "a\r\nX-Injected: 1".to_string()));
        let err = UreqTransport::new().send(req).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidArguments(msg) if msg.contains("X-Name")));

        let mut req = request("GET", "http://127.0.0.1:9/", None);
        req.headers.push(("X-Bad\nName".to_string(), "v".to_string()));
        assert!(matches!(
            UreqTransport::new().send(req).await,
            Err(ProviderError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{}/", port);
        let err = UreqTransport::new().send(request("GET", &url, None)).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
    }

    #[test]
    fn test_check_headers_accepts_plain_values() {
        let headers = vec![("Authorization".to_string(), "Bearer abc: def".to_string())];
        assert!(check_headers(&headers).is_ok());
    }
}
