//! Building blocks of the doorbell recognition pipeline: the event model, and the collaborators
//! the pipeline talks to (event source, recognition service, visitor store, result sink and push
//! notifications), each behind a trait with a PostgreSQL or HTTP implementation.
pub mod database;
pub mod event;
pub mod events;
pub mod metrics;
pub mod notification;
pub mod recognition;
pub mod results;
pub mod retry;
pub mod visitors;
