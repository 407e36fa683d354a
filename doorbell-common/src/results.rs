//! # Recognition results
//!
//! One terminal result per doorbell event. Writes fully replace any previous result for the same
//! event, so a retried run can safely write again: the last writer wins.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;

use crate::database::{DatabaseError, DatabaseResult};

/// Name recorded when recognition ran but matched nobody.
pub const UNKNOWN_NAME: &str = "unknown";
/// Name recorded when recognition could not classify the image at all.
pub const UNCLASSIFIED_NAME: &str = "unclassified";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub device_id: String,
    /// When the worker produced this result.
    pub timestamp: DateTime<Utc>,
    /// When the producer says the event happened.
    pub original_timestamp: Option<DateTime<Utc>>,
    pub recognized: bool,
    /// A visitor name, `"unknown"` or `"unclassified"`.
    pub name: String,
    pub authorized: bool,
    pub image_reference: Option<String>,
    pub message_type: String,
    /// Every name the recognition service returned, in its order.
    #[serde(rename = "names")]
    pub candidate_names: Vec<String>,
    /// Why the event did not resolve to a match, e.g. a timeout or "no faces detected".
    pub message: Option<String>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store `result` as the one result of `event_id`, replacing any previous one.
    async fn put(&self, event_id: &str, result: &RecognitionResult) -> DatabaseResult<()>;

    async fn get(&self, event_id: &str) -> DatabaseResult<Option<RecognitionResult>>;
}

#[derive(Clone)]
pub struct PgResultSink {
    pool: PgPool,
}

impl PgResultSink {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    async fn put(&self, event_id: &str, result: &RecognitionResult) -> DatabaseResult<()> {
        let base_query = r#"
INSERT INTO recognition_results
    (event_id, device_id, timestamp, original_timestamp, recognized, name, authorized, image_reference, message_type, candidate_names, message)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (event_id) DO UPDATE SET
    device_id = EXCLUDED.device_id,
    timestamp = EXCLUDED.timestamp,
    original_timestamp = EXCLUDED.original_timestamp,
    recognized = EXCLUDED.recognized,
    name = EXCLUDED.name,
    authorized = EXCLUDED.authorized,
    image_reference = EXCLUDED.image_reference,
    message_type = EXCLUDED.message_type,
    candidate_names = EXCLUDED.candidate_names,
    message = EXCLUDED.message,
    write_count = recognition_results.write_count + 1,
    updated_at = NOW()
        "#;

        sqlx::query(base_query)
            .bind(event_id)
            .bind(&result.device_id)
            .bind(result.timestamp)
            .bind(result.original_timestamp)
            .bind(result.recognized)
            .bind(&result.name)
            .bind(result.authorized)
            .bind(&result.image_reference)
            .bind(&result.message_type)
            .bind(&result.candidate_names)
            .bind(&result.message)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("INSERT", error))?;

        Ok(())
    }

    async fn get(&self, event_id: &str) -> DatabaseResult<Option<RecognitionResult>> {
        let base_query = r#"
SELECT
    device_id, timestamp, original_timestamp, recognized, name, authorized, image_reference, message_type, candidate_names, message
FROM
    recognition_results
WHERE
    event_id = $1
        "#;

        sqlx::query_as(base_query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))
    }
}
