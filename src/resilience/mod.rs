//! # Resilience Module
//!
//! Retry and backoff for per-item stage processing. A [`RetryPolicy`] is applied
//! by the worker around every processor invocation; only failures the processor
//! marks as retryable are re-attempted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batchflow_core::resilience::RetryPolicy;
//! use batchflow_core::ItemError;
//!
//! # async fn example() {
//! let policy = RetryPolicy::default();
//! let outcome = policy
//!     .run(|attempt| async move {
//!         if attempt < 2 {
//!             Err::<u32, _>(ItemError::retryable("rate limited"))
//!         } else {
//!             Ok(attempt)
//!         }
//!     })
//!     .await;
//! assert_eq!(outcome.attempts, 2);
//! # }
//! ```

pub mod retry_policy;

pub use retry_policy::{RetryOutcome, RetryPolicy};
