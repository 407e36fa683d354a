//! Connection pool and schema setup shared by the PostgreSQL backed collaborators.
use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

/// Enumeration of database-related errors.
/// Errors that originate from sqlx are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

impl DatabaseError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        DatabaseError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Build a lazily connecting pool, so the worker can start (and report unhealthy) while the
/// database is still unreachable.
pub fn connect_lazy(url: &str, max_connections: u32, app_name: &str) -> DatabaseResult<PgPool> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|error| DatabaseError::PoolCreationError { error })?
        .application_name(app_name);

    Ok(PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy_with(options))
}

/// Apply the migrations under `migrations/` at the root of the workspace.
pub async fn run_migrations(pool: &PgPool) -> DatabaseResult<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .map_err(|error| DatabaseError::MigrationError { error })
}
