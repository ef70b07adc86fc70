//! Log anomaly processor
//!
//! Consumes log lines from a Redis stream as a member of a consumer group,
//! scores each message with an anomaly classifier, upserts the result into
//! PostgreSQL and acknowledges the entry only once the row is durable.

pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;

pub use config::Config;
pub use context::AppContext;
pub use error::{ProcessorError, Result};
