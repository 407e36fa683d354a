//! # Doorbell events
//!
//! Events are appended by doorbell devices (or the gateway in front of them) and are read-only to
//! the worker, with the exception of their claim marker. Producers are not consistent in how they
//! name fields, so payloads are decoded leniently: an event is never rejected for its shape, it
//! just ends up with less information (and, without an image, with a non-match result).
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Keys carrying inline, base64 encoded image data.
const INLINE_IMAGE_KEYS: [&str; 2] = ["image", "imageBase64"];
/// Key carrying an image reference, which may be a URL or inline data.
const IMAGE_REF_KEY: &str = "imageRef";
/// Key carrying an image URL. Anything that is not an http(s) URL there is ignored.
const IMAGE_URL_KEY: &str = "imageUrl";
const DEVICE_ID_KEYS: [&str; 2] = ["deviceId", "device_id"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "createdAt", "occurredAt"];
const MESSAGE_TYPE_KEYS: [&str; 2] = ["messageType", "type"];

pub const DEFAULT_DEVICE_ID: &str = "unknown";
pub const DEFAULT_MESSAGE_TYPE: &str = "doorbell_ring";

/// Where the image of a doorbell event can be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Encoded image bytes, as sent by the device.
    Inline(String),
    /// A URL the image can be downloaded from.
    Url(String),
}

impl ImageRef {
    /// Classify a raw `imageRef` value: http(s) URLs are references, anything else is inline data.
    pub fn parse(raw: &str) -> Option<ImageRef> {
        if raw.trim().is_empty() {
            return None;
        }

        ImageRef::parse_url(raw).or_else(|| Some(ImageRef::Inline(raw.to_owned())))
    }

    /// Accept only http(s) URLs.
    pub fn parse_url(raw: &str) -> Option<ImageRef> {
        let trimmed = raw.trim();
        match url::Url::parse(trimmed) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                Some(ImageRef::Url(trimmed.to_owned()))
            }
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ImageRef::Url(url) => Some(url),
            ImageRef::Inline(_) => None,
        }
    }
}

/// Per-event marker used to avoid processing the same event twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Claimed,
}

impl ClaimState {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimState::Claimed)
    }
}

impl From<bool> for ClaimState {
    fn from(claimed: bool) -> Self {
        if claimed {
            ClaimState::Claimed
        } else {
            ClaimState::Unclaimed
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClaimState::Unclaimed => write!(f, "unclaimed"),
            ClaimState::Claimed => write!(f, "claimed"),
        }
    }
}

/// One ring or motion trigger of a doorbell.
#[derive(Debug, Clone, PartialEq)]
pub struct DoorbellEvent {
    /// Unique id assigned by the event source.
    pub id: String,
    /// The image to run recognition on. `None` resolves to a non-match result.
    pub image: Option<ImageRef>,
    pub device_id: String,
    /// Producer timestamp, if the producer sent one we could understand.
    pub occurred_at: Option<DateTime<Utc>>,
    pub message_type: String,
    pub claim_state: ClaimState,
    /// Number of times this event has been claimed so far.
    pub attempt: i32,
}

impl DoorbellEvent {
    /// Build an unclaimed event from a raw producer payload.
    /// Payloads that are not JSON objects produce an event without image.
    pub fn from_payload(id: &str, payload: &Value) -> DoorbellEvent {
        let empty = Map::new();
        let object = payload.as_object().unwrap_or(&empty);

        let image = first_str(object, &INLINE_IMAGE_KEYS)
            .filter(|data| !data.trim().is_empty())
            .map(|data| ImageRef::Inline(data.to_owned()))
            .or_else(|| first_str(object, &[IMAGE_REF_KEY]).and_then(ImageRef::parse))
            .or_else(|| first_str(object, &[IMAGE_URL_KEY]).and_then(ImageRef::parse_url));

        let device_id = first_str(object, &DEVICE_ID_KEYS)
            .unwrap_or(DEFAULT_DEVICE_ID)
            .to_owned();

        let occurred_at = TIMESTAMP_KEYS
            .iter()
            .filter_map(|key| object.get(*key))
            .find_map(parse_timestamp);

        let message_type = first_str(object, &MESSAGE_TYPE_KEYS)
            .unwrap_or(DEFAULT_MESSAGE_TYPE)
            .to_owned();

        DoorbellEvent {
            id: id.to_owned(),
            image,
            device_id,
            occurred_at,
            message_type,
            claim_state: ClaimState::Unclaimed,
            attempt: 0,
        }
    }
}

fn first_str<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(Value::as_str)
}

/// Producer timestamps are either epoch milliseconds (as a number or a numeric string) or RFC 3339.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64))
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::String(s) => {
            if let Ok(millis) = s.trim().parse::<i64>() {
                return Utc.timestamp_millis_opt(millis).single();
            }
            DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}
