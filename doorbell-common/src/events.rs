//! # Event source and claim guard
//!
//! Doorbell events are appended to the `doorbell_events` table by producers. Each row carries a
//! `claimed` flag: a worker flips it before doing any work on the event, and flips it back if the
//! work fails so a later poll can retry the event.
//!
//! This is a best-effort single-writer guard. The flip itself is a compare-and-set, so two workers
//! polling the same event cannot both claim it, but a worker that crashes after claiming leaves the
//! event claimed until `reclaim_stale` resets it, and the retried run may repeat side effects of the
//! crashed one.
use std::time;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;

use crate::database::{DatabaseError, DatabaseResult};
use crate::event::{ClaimState, DoorbellEvent};

/// Outcome of trying to claim an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The event is ours. `attempt` counts this claim.
    Acquired { attempt: i32 },
    /// Someone already claimed the event, or it does not exist anymore.
    AlreadyClaimed,
}

/// The feed of doorbell events, together with their claim markers.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch up to `limit` unclaimed events that are due, in append order.
    async fn poll(&self, limit: u32) -> DatabaseResult<Vec<DoorbellEvent>>;

    /// Atomically move an event from unclaimed to claimed.
    async fn try_claim(&self, event_id: &str, claimed_by: &str) -> DatabaseResult<Claim>;

    /// Reset a claimed event to unclaimed. It becomes visible to `poll` again after `retry_after`.
    async fn release(&self, event_id: &str, retry_after: time::Duration) -> DatabaseResult<()>;

    /// Release events that have been claimed for longer than `older_than` without producing a
    /// recognition result. Returns how many events were released.
    async fn reclaim_stale(&self, older_than: time::Duration) -> DatabaseResult<u64>;
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    payload: sqlx::types::Json<Value>,
    claimed: bool,
    attempt: i32,
}

impl From<EventRow> for DoorbellEvent {
    fn from(row: EventRow) -> Self {
        let mut event = DoorbellEvent::from_payload(&row.id, &row.payload.0);
        event.claim_state = ClaimState::from(row.claimed);
        event.attempt = row.attempt;
        event
    }
}

/// An `EventSource` implemented on top of a PostgreSQL table.
#[derive(Clone)]
pub struct PgEventSource {
    pool: PgPool,
}

impl PgEventSource {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an event. Appending an id that already exists is a no-op, as producers deliver
    /// at-least-once.
    pub async fn append(&self, event_id: &str, payload: &Value) -> DatabaseResult<bool> {
        let base_query = r#"
INSERT INTO doorbell_events
    (id, payload)
VALUES
    ($1, $2)
ON CONFLICT (id) DO NOTHING
        "#;

        let result = sqlx::query(base_query)
            .bind(event_id)
            .bind(sqlx::types::Json(payload))
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("INSERT", error))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, event_id: &str) -> DatabaseResult<Option<DoorbellEvent>> {
        let base_query = r#"
SELECT
    id, payload, claimed, attempt
FROM
    doorbell_events
WHERE
    id = $1
        "#;

        let row: Option<EventRow> = sqlx::query_as(base_query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))?;

        Ok(row.map(DoorbellEvent::from))
    }
}

#[async_trait]
impl EventSource for PgEventSource {
    async fn poll(&self, limit: u32) -> DatabaseResult<Vec<DoorbellEvent>> {
        let base_query = r#"
SELECT
    id, payload, claimed, attempt
FROM
    doorbell_events
WHERE
    NOT claimed
    AND available_at <= NOW()
ORDER BY
    seq
LIMIT $1
        "#;

        let rows: Vec<EventRow> = sqlx::query_as(base_query)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))?;

        Ok(rows.into_iter().map(DoorbellEvent::from).collect())
    }

    async fn try_claim(&self, event_id: &str, claimed_by: &str) -> DatabaseResult<Claim> {
        let base_query = r#"
UPDATE
    doorbell_events
SET
    claimed = TRUE,
    claimed_at = NOW(),
    claimed_by = $2,
    attempt = attempt + 1
WHERE
    id = $1
    AND NOT claimed
RETURNING
    attempt
        "#;

        let attempt: Option<i32> = sqlx::query_scalar(base_query)
            .bind(event_id)
            .bind(claimed_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(match attempt {
            Some(attempt) => Claim::Acquired { attempt },
            None => Claim::AlreadyClaimed,
        })
    }

    async fn release(&self, event_id: &str, retry_after: time::Duration) -> DatabaseResult<()> {
        let base_query = r#"
UPDATE
    doorbell_events
SET
    claimed = FALSE,
    claimed_at = NULL,
    claimed_by = NULL,
    available_at = NOW() + $2
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(event_id)
            .bind(retry_after)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(())
    }

    async fn reclaim_stale(&self, older_than: time::Duration) -> DatabaseResult<u64> {
        let base_query = r#"
UPDATE
    doorbell_events
SET
    claimed = FALSE,
    claimed_at = NULL,
    claimed_by = NULL,
    available_at = NOW()
WHERE
    claimed
    AND claimed_at < NOW() - $1
    AND NOT EXISTS (
        SELECT 1 FROM recognition_results WHERE recognition_results.event_id = doorbell_events.id
    )
        "#;

        let result = sqlx::query(base_query)
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(result.rows_affected())
    }
}
