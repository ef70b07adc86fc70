//! Resilience helpers shared by the backend services
//!
//! - **Retry**: exponential backoff with optional jitter, with a predicate to
//!   stop early on errors that will never succeed
//! - **Timeout**: deadline wrappers that turn an elapsed future into an error
//!
//! # Example: retry a startup probe
//!
//! ```rust,no_run
//! use resilience::{with_retry, RetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let result = with_retry(RetryConfig::default(), || async {
//!         // Connect to Redis, PostgreSQL, ...
//!         Ok::<_, String>(())
//!     })
//!     .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod retry;
pub mod timeout;

pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
pub use timeout::{with_timeout, with_timeout_result, TimeoutError};
