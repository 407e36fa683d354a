//! # Recognition
//!
//! Client side of the face recognition service. The service is a black box: given an image it
//! answers with the names it recognized. It may be slow, down, or answer garbage, none of which is
//! allowed to escape this module as an error. Every fault is folded into a `RecognitionOutcome`
//! that did not succeed.
use std::time;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MISSING_IMAGE_MESSAGE: &str = "unclassified: no image available for recognition";
pub const TIMEOUT_MESSAGE: &str = "unclassified: recognition timed out";

/// The raw answer of the recognition service for a single image. Never persisted as is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecognitionOutcome {
    /// Whether the service ran at all.
    pub succeeded: bool,
    /// Whether the service found a confident match.
    pub authenticated: bool,
    /// Recognized names, best first. May be empty.
    pub candidate_names: Vec<String>,
    /// Diagnostic message.
    pub message: String,
}

impl RecognitionOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            authenticated: false,
            candidate_names: Vec::new(),
            message: message.into(),
        }
    }

    pub fn missing_image() -> Self {
        Self::failed(MISSING_IMAGE_MESSAGE)
    }

    /// Whether the image was never classified, as opposed to classified as nobody we know.
    /// Anything that did not run is unclassified, as is an explicit "unclassified" answer.
    pub fn is_unclassified(&self) -> bool {
        !self.succeeded || self.message.to_lowercase().contains("unclassified")
    }

    /// Whether the service produced at least one name it is confident about.
    pub fn is_match(&self) -> bool {
        self.succeeded && self.authenticated && !self.candidate_names.is_empty()
    }
}

#[async_trait]
pub trait RecognitionOracle: Send + Sync {
    /// Run recognition on a base64 encoded image. Infallible: faults are returned as outcomes
    /// that did not succeed.
    async fn recognize(&self, image: &str) -> RecognitionOutcome;
}

#[derive(Serialize)]
struct RecognitionRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize, Debug)]
struct RecognitionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    recognized_names: Vec<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<RecognitionResponse> for RecognitionOutcome {
    fn from(response: RecognitionResponse) -> Self {
        let message = response
            .message
            .or(response.error)
            .unwrap_or_default();

        RecognitionOutcome {
            succeeded: response.success,
            authenticated: response.authenticated,
            candidate_names: response
                .recognized_names
                .into_iter()
                .map(|name| name.trim().to_owned())
                .filter(|name| !name.is_empty())
                .collect(),
            message,
        }
    }
}

/// A `RecognitionOracle` reached over HTTP: `POST <base_url>/recognize` with `{"image": ...}`.
#[derive(Clone)]
pub struct HttpRecognitionOracle {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRecognitionOracle {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> reqwest::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Doorbell Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            endpoint: format!("{}/recognize", base_url.trim_end_matches('/')),
            client,
        })
    }

    async fn call(&self, image: &str) -> Result<RecognitionOutcome, OracleFault> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RecognitionRequest { image })
            .send()
            .await
            .map_err(OracleFault::from_reqwest)?;

        let status = response.status();
        let body = response.bytes().await.map_err(OracleFault::from_reqwest)?;

        match serde_json::from_slice::<RecognitionResponse>(&body) {
            Ok(parsed) => {
                let mut outcome = RecognitionOutcome::from(parsed);
                if !status.is_success() {
                    outcome.succeeded = false;
                    outcome.authenticated = false;
                }
                Ok(outcome)
            }
            Err(_) if !status.is_success() => Err(OracleFault::Status(status)),
            Err(error) => Err(OracleFault::Malformed(error.to_string())),
        }
    }
}

#[async_trait]
impl RecognitionOracle for HttpRecognitionOracle {
    async fn recognize(&self, image: &str) -> RecognitionOutcome {
        match self.call(image).await {
            Ok(outcome) => {
                if !outcome.succeeded {
                    metrics::counter!("doorbell_oracle_failures", &[("reason", "rejected")])
                        .increment(1);
                }
                outcome
            }
            Err(fault) => {
                warn!("recognition service call failed: {}", fault);
                metrics::counter!("doorbell_oracle_failures", &[("reason", fault.reason())])
                    .increment(1);
                fault.into_outcome()
            }
        }
    }
}

/// Everything that can go wrong talking to the recognition service.
#[derive(Debug)]
enum OracleFault {
    Timeout,
    Unreachable(String),
    Status(StatusCode),
    Malformed(String),
}

impl OracleFault {
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            OracleFault::Timeout
        } else {
            OracleFault::Unreachable(error.to_string())
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            OracleFault::Timeout => "timeout",
            OracleFault::Unreachable(_) => "unreachable",
            OracleFault::Status(_) => "status",
            OracleFault::Malformed(_) => "malformed",
        }
    }

    fn into_outcome(self) -> RecognitionOutcome {
        match self {
            OracleFault::Timeout => RecognitionOutcome::failed(TIMEOUT_MESSAGE),
            other => RecognitionOutcome::failed(format!("unclassified: {other}")),
        }
    }
}

impl std::fmt::Display for OracleFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OracleFault::Timeout => write!(f, "recognition timed out"),
            OracleFault::Unreachable(error) => write!(f, "recognition service unreachable: {error}"),
            OracleFault::Status(status) => write!(f, "recognition service returned {status}"),
            OracleFault::Malformed(error) => write!(f, "malformed recognition response: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn oracle(server: &MockServer, timeout: time::Duration) -> HttpRecognitionOracle {
        HttpRecognitionOracle::new(&server.base_url(), timeout).expect("failed to build oracle")
    }

    #[test]
    fn test_unclassified_and_match() {
        let failed = RecognitionOutcome::failed("connection refused");
        assert!(failed.is_unclassified());
        assert!(!failed.is_match());

        let nobody = RecognitionOutcome {
            succeeded: true,
            authenticated: false,
            candidate_names: vec![],
            message: "No recognized faces".to_owned(),
        };
        assert!(!nobody.is_unclassified());

        let explicit = RecognitionOutcome {
            message: "Face UNCLASSIFIED".to_owned(),
            ..nobody.clone()
        };
        assert!(explicit.is_unclassified());

        let claimed_without_name = RecognitionOutcome {
            authenticated: true,
            ..nobody
        };
        assert!(!claimed_without_name.is_match());
    }

    #[tokio::test]
    async fn test_recognize_authenticated() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/recognize")
                    .json_body(json!({"image": "aGVsbG8="}));
                then.status(200).json_body(json!({
                    "success": true,
                    "authenticated": true,
                    "message": "Authenticated as Ali",
                    "recognized_names": ["Ali", " "],
                    "faces_detected": 1
                }));
            })
            .await;

        let outcome = oracle(&server, time::Duration::from_secs(5))
            .recognize("aGVsbG8=")
            .await;

        mock.assert_async().await;
        assert!(outcome.succeeded);
        assert!(outcome.authenticated);
        assert_eq!(outcome.candidate_names, vec!["Ali".to_owned()]);
        assert_eq!(outcome.message, "Authenticated as Ali");
    }

    #[tokio::test]
    async fn test_recognize_error_status_with_json_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/recognize");
                then.status(400).json_body(json!({
                    "success": false,
                    "authenticated": false,
                    "error": "Invalid image format. Supported formats: JPG, PNG, BMP"
                }));
            })
            .await;

        let outcome = oracle(&server, time::Duration::from_secs(5))
            .recognize("not an image")
            .await;

        assert!(!outcome.succeeded);
        assert!(outcome.is_unclassified());
        assert_eq!(
            outcome.message,
            "Invalid image format. Supported formats: JPG, PNG, BMP"
        );
    }

    #[tokio::test]
    async fn test_recognize_error_status_without_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/recognize");
                then.status(502).body("bad gateway");
            })
            .await;

        let outcome = oracle(&server, time::Duration::from_secs(5))
            .recognize("aGVsbG8=")
            .await;

        assert!(!outcome.succeeded);
        assert!(outcome.is_unclassified());
        assert!(outcome.message.contains("502"));
    }

    #[tokio::test]
    async fn test_recognize_malformed_response() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/recognize");
                then.status(200).body("<html>hello</html>");
            })
            .await;

        let outcome = oracle(&server, time::Duration::from_secs(5))
            .recognize("aGVsbG8=")
            .await;

        assert!(!outcome.succeeded);
        assert!(outcome.message.contains("malformed"));
    }

    #[tokio::test]
    async fn test_recognize_timeout() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/recognize");
                then.status(200)
                    .delay(time::Duration::from_millis(500))
                    .json_body(json!({"success": true, "authenticated": true, "recognized_names": ["Ali"]}));
            })
            .await;

        let outcome = oracle(&server, time::Duration::from_millis(50))
            .recognize("aGVsbG8=")
            .await;

        assert_eq!(outcome, RecognitionOutcome::failed(TIMEOUT_MESSAGE));
        assert!(outcome.is_unclassified());
    }
}
