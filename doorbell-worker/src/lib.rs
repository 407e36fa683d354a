pub mod authorization;
pub mod config;
pub mod error;
pub mod handlers;
pub mod image;
pub mod listener;
pub mod pipeline;
pub mod sweeper;
