//! # Notifications
//!
//! Push notifications telling subscribed clients what happened at the door. Delivery is
//! best-effort: the result they summarize is already stored when they are sent.
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header;
use serde_json::json;
use thiserror::Error;

use crate::results::{RecognitionResult, UNCLASSIFIED_NAME, UNKNOWN_NAME};

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("push request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("push gateway rejected notification with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Structured fields for programmatic consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationData {
    pub event_id: String,
    pub name: String,
    pub authorized: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    pub title: String,
    pub body: String,
    pub data: NotificationData,
}

impl Notification {
    pub fn for_result(topic: &str, event_id: &str, result: &RecognitionResult) -> Self {
        let known = result.name != UNKNOWN_NAME && result.name != UNCLASSIFIED_NAME;
        let (title, body) = match (result.authorized, known) {
            (true, _) => (
                "Authorized visitor".to_owned(),
                format!("{} is at the door", result.name),
            ),
            (false, true) => (
                "Visitor at the door".to_owned(),
                format!("{} is at the door (not authorized)", result.name),
            ),
            (false, false) => (
                "Unknown visitor".to_owned(),
                "Someone is at the door".to_owned(),
            ),
        };

        Notification {
            topic: topic.to_owned(),
            title,
            body,
            data: NotificationData {
                event_id: event_id.to_owned(),
                name: result.name.clone(),
                authorized: result.authorized,
                timestamp: result.timestamp,
            },
        }
    }

    /// Topic message as accepted by the push gateway. Gateways only take string data values.
    pub fn to_message(&self) -> serde_json::Value {
        json!({
            "message": {
                "topic": self.topic,
                "notification": {
                    "title": self.title,
                    "body": self.body,
                },
                "data": {
                    "eventId": self.data.event_id,
                    "name": self.data.name,
                    "authorized": self.data.authorized.to_string(),
                    "timestamp": self.data.timestamp.to_rfc3339(),
                },
            }
        })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// A `Notifier` posting topic messages to an HTTP push gateway.
#[derive(Clone)]
pub struct PushNotifier {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl PushNotifier {
    pub fn new(
        url: &str,
        token: Option<String>,
        request_timeout: time::Duration,
    ) -> reqwest::Result<Self> {
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
            url: url.to_owned(),
            token: token.filter(|token| !token.is_empty()),
            client,
        })
    }
}

#[async_trait]
impl Notifier for PushNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.url).json(&notification.to_message());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotificationError::Rejected { status, body })
    }
}
