use doorbell_common::database::DatabaseError;
use thiserror::Error;

/// Errors that abort the processing of a single event. The event's claim is released so it can be
/// retried; everything with a safe default is absorbed into the result instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to persist recognition result: {0}")]
    PersistenceError(#[from] DatabaseError),
}

/// Enumeration of errors related to initialization of the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred while starting the worker: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("failed to construct an http client: {0}")]
    HttpClientError(#[from] reqwest::Error),
    #[error("failed to install metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
}
