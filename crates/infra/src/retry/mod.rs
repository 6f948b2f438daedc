//! Retry with backoff for calls to flaky external dependencies.
//!
//! ## Components
//!
//! - `RetryPolicy`: attempts, delay shape and error classification for one
//!   operation class (`"processor"`, `"notifier"`, ...)
//! - `RetryPolicies`: policies keyed by operation class, with a default
//! - `RetryExecutor`: runs an async operation under a policy, honouring
//!   cancellation between attempts
//! - `Classify`: lets an error tag itself retryable or terminal at its origin;
//!   substring patterns are the fallback for opaque errors

pub mod executor;
pub mod policy;

pub use executor::{RetryError, RetryExecutor};
pub use policy::{BackoffStrategy, Classify, ErrorClass, RetryPolicies, RetryPolicy};
