//! # Visitors
//!
//! Authorization records of people known to a household. Records are created and removed by an
//! administrative process; the worker only reads them and keeps their visit tracking up to date.
//!
//! Names are matched case-insensitively and tolerate substrings in either direction, so a
//! recognized "ali" matches a stored "Ali Khan" and a recognized "Ali Khan (front)" matches a
//! stored "Ali Khan". When several authorized visitors match, the one created first wins: there is
//! no ranking by recognition confidence.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::database::{DatabaseError, DatabaseResult};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Visitor {
    pub id: i64,
    /// Canonical name, as entered by the administrator.
    pub name: String,
    pub is_authorized: bool,
    pub visit_count: i64,
    pub last_visit: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait VisitorStore: Send + Sync {
    /// Find the first authorized visitor whose name matches `name`.
    async fn find_authorized_by_name(&self, name: &str) -> DatabaseResult<Option<Visitor>>;

    /// Count one more visit and refresh `last_visit`. A single-record atomic update.
    async fn increment_visit(&self, visitor_id: i64) -> DatabaseResult<()>;
}

/// The matching rule `PgVisitorStore` applies in SQL.
pub fn name_matches(stored: &str, candidate: &str) -> bool {
    let stored = stored.trim().to_lowercase();
    let candidate = candidate.trim().to_lowercase();
    if stored.is_empty() || candidate.is_empty() {
        return false;
    }
    stored.contains(&candidate) || candidate.contains(&stored)
}

/// Escape LIKE wildcards so a candidate name only ever matches literally.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[derive(Clone)]
pub struct PgVisitorStore {
    pool: PgPool,
}

impl PgVisitorStore {
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VisitorStore for PgVisitorStore {
    async fn find_authorized_by_name(&self, name: &str) -> DatabaseResult<Option<Visitor>> {
        let candidate = name.trim();
        if candidate.is_empty() {
            return Ok(None);
        }

        let base_query = r#"
SELECT
    id, name, is_authorized, visit_count, last_visit
FROM
    visitors
WHERE
    is_authorized
    AND name <> ''
    AND (
        name ILIKE '%' || $1 || '%'
        OR $2 ILIKE '%' || replace(replace(replace(name, '\', '\\'), '%', '\%'), '_', '\_') || '%'
    )
ORDER BY
    id
LIMIT 1
        "#;

        sqlx::query_as(base_query)
            .bind(escape_like(candidate))
            .bind(candidate)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))
    }

    async fn increment_visit(&self, visitor_id: i64) -> DatabaseResult<()> {
        let base_query = r#"
UPDATE
    visitors
SET
    visit_count = visit_count + 1,
    last_visit = NOW()
WHERE
    id = $1
        "#;

        sqlx::query(base_query)
            .bind(visitor_id)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(())
    }
}
