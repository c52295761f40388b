//! Status lookups against the ceremony service.
//!
//! A client performs exactly one lookup per call and classifies the outcome.
//! Retry, backoff and scheduling live in the probe and the monitor.

use crate::TransportError;
use async_trait::async_trait;
use ceremony_core::{RawStatus, ServiceStatus, Token};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Trait for status service clients.
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Perform one status lookup for one token.
    async fn probe(&self, token: &Token) -> Result<RawStatus, TransportError>;
}

/// Configuration for the HTTP status client.
#[derive(Debug, Clone)]
pub struct StatusClientConfig {
    /// Service root, without trailing slash.
    pub base_url: String,
    /// Liveness endpoint returning `{"status": ...}`.
    pub ping_path: String,
    /// Queue endpoint returning `{"behind": N}`.
    pub position_path: String,
    /// Bound applied to every request.
    pub request_timeout: Duration,
}

impl Default for StatusClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ceremony-backend.silentprotocol.org".to_string(),
            ping_path: "/ceremony/ping".to_string(),
            position_path: "/ceremony/position".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

enum Reply {
    Body(Value),
    RateLimited,
}

/// reqwest-backed client for the ceremony service.
pub struct HttpStatusClient {
    http: reqwest::Client,
    config: StatusClientConfig,
}

impl HttpStatusClient {
    /// Create a new client.
    pub fn new(config: StatusClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("Failed to build client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &StatusClientConfig {
        &self.config
    }

    async fn fetch(&self, path: &str, token: &Token) -> Result<Reply, TransportError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let response = self
            .http
            .get(&url)
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.without_url().to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(Reply::RateLimited);
        }
        if status.is_server_error() {
            return Err(TransportError::Unreachable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(TransportError::Malformed(format!("HTTP {}", status)));
        }

        // A body that stalls past the timeout counts as no response.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Unreachable(e.without_url().to_string()))?;

        Ok(Reply::Body(serde_json::from_slice(&bytes)?))
    }
}

/// Extract the `status` code from a ping body.
fn parse_status(body: &Value) -> Result<&str, TransportError> {
    body.get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::Malformed("Missing status field".to_string()))
}

/// Extract the `behind` position. Numbers and numeric strings are accepted.
fn parse_position(body: &Value) -> Result<Option<u64>, TransportError> {
    match body.get("behind") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| TransportError::Malformed(format!("Invalid position: {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TransportError::Malformed(format!("Invalid position: {:?}", s))),
        Some(other) => Err(TransportError::Malformed(format!(
            "Invalid position type: {}",
            other
        ))),
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn probe(&self, token: &Token) -> Result<RawStatus, TransportError> {
        let ping = match self.fetch(&self.config.ping_path, token).await? {
            Reply::RateLimited => return Ok(RawStatus::temporary("rate_limited")),
            Reply::Body(body) => body,
        };
        let code = parse_status(&ping)?;

        if ServiceStatus::from_code(code) != ServiceStatus::Active {
            debug!(token = %token, code = code, "Ping reported non-active status");
            return Ok(RawStatus::from_code(code, None));
        }

        let position = match self.fetch(&self.config.position_path, token).await? {
            Reply::RateLimited => return Ok(RawStatus::temporary("rate_limited")),
            Reply::Body(body) => parse_position(&body)?,
        };

        Ok(RawStatus::from_code(code, position))
    }
}

/// Scripted client for testing.
///
/// Each token has a queue of outcomes consumed one per probe. An exhausted
/// or missing queue answers `Unreachable`.
#[derive(Default)]
pub struct ScriptedStatusClient {
    scripts: Mutex<HashMap<Token, VecDeque<Result<RawStatus, TransportError>>>>,
    calls: AtomicUsize,
}

impl ScriptedStatusClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one outcome for a token.
    pub fn push(&self, token: &Token, outcome: Result<RawStatus, TransportError>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(token.clone()).or_default().push_back(outcome);
        }
    }

    /// Queue several outcomes for a token, in order.
    pub fn push_all<I>(&self, token: &Token, outcomes: I)
    where
        I: IntoIterator<Item = Result<RawStatus, TransportError>>,
    {
        for outcome in outcomes {
            self.push(token, outcome);
        }
    }

    /// Total probes performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Outcomes not yet consumed for a token.
    pub fn remaining(&self, token: &Token) -> usize {
        self.scripts
            .lock()
            .map(|s| s.get(token).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl StatusClient for ScriptedStatusClient {
    async fn probe(&self, token: &Token) -> Result<RawStatus, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(token).and_then(VecDeque::pop_front));
        next.unwrap_or_else(|| Err(TransportError::Unreachable("Script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token() -> Token {
        Token::new("abc123xyz").unwrap()
    }

    fn client_for(server: &MockServer) -> HttpStatusClient {
        HttpStatusClient::new(StatusClientConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap()
    }

    async fn mount_ping(server: &MockServer, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/ceremony/ping"))
            .and(header("Authorization", "Bearer abc123xyz"))
            .respond_with(template)
            .mount(server)
            .await;
    }

    async fn mount_position(server: &MockServer, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/ceremony/position"))
            .and(header("Authorization", "Bearer abc123xyz"))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_active_with_position() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_json(json!({"status": "ok"}))).await;
        mount_position(&server, ResponseTemplate::new(200).set_body_json(json!({"behind": 1603}))).await;

        let raw = client_for(&server).probe(&token()).await.unwrap();
        assert_eq!(raw.kind, ServiceStatus::Active);
        assert_eq!(raw.position, Some(1603));
    }

    #[tokio::test]
    async fn test_position_as_string() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_json(json!({"status": "active"}))).await;
        mount_position(&server, ResponseTemplate::new(200).set_body_json(json!({"behind": "42"}))).await;

        let raw = client_for(&server).probe(&token()).await.unwrap();
        assert_eq!(raw.position, Some(42));
    }

    #[tokio::test]
    async fn test_negative_position_is_malformed() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_json(json!({"status": "ok"}))).await;
        mount_position(&server, ResponseTemplate::new(200).set_body_json(json!({"behind": -3}))).await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_unrecognized_status_is_unknown_raw_status() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_json(json!({"status": "sleeping"}))).await;

        let raw = client_for(&server).probe(&token()).await.unwrap();
        assert_eq!(raw.kind, ServiceStatus::Unknown);
        assert_eq!(raw.code, "sleeping");
        assert_eq!(raw.position, None);
    }

    #[tokio::test]
    async fn test_temporary_status_skips_position_lookup() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_json(json!({"status": "maintenance"}))).await;
        Mock::given(path("/ceremony/position"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"behind": 1})))
            .expect(0)
            .mount(&server)
            .await;

        let raw = client_for(&server).probe(&token()).await.unwrap();
        assert_eq!(raw.kind, ServiceStatus::Temporary);
    }

    #[tokio::test]
    async fn test_rate_limited_is_temporary() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(429)).await;

        let raw = client_for(&server).probe(&token()).await.unwrap();
        assert_eq!(raw.kind, ServiceStatus::Temporary);
        assert_eq!(raw.code, "rate_limited");
    }

    #[tokio::test]
    async fn test_server_error_is_unreachable() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(503)).await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_client_error_is_malformed() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(401)).await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_string("<html>oops</html>")).await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_missing_status_field_is_malformed() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_json(json!({"state": "ok"}))).await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let server = MockServer::start().await;
        mount_ping(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "ok"}))
                .set_delay(Duration::from_secs(3)),
        )
        .await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let client = HttpStatusClient::new(StatusClientConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();

        let err = client.probe(&token()).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_errors_never_contain_token() {
        let server = MockServer::start().await;
        mount_ping(&server, ResponseTemplate::new(200).set_body_string("garbage")).await;

        let err = client_for(&server).probe(&token()).await.unwrap_err();
        assert!(!err.to_string().contains("abc123xyz"));
    }

    #[tokio::test]
    async fn test_scripted_client_consumes_in_order() {
        let client = ScriptedStatusClient::new();
        let t = token();
        client.push_all(
            &t,
            [
                Ok(RawStatus::active(10)),
                Err(TransportError::Malformed("bad".into())),
            ],
        );

        assert_eq!(client.probe(&t).await.unwrap().position, Some(10));
        assert!(client.probe(&t).await.is_err());
        // Exhausted scripts answer Unreachable.
        assert!(client.probe(&t).await.unwrap_err().is_unreachable());
        assert_eq!(client.calls(), 3);
        assert_eq!(client.remaining(&t), 0);
    }
}
