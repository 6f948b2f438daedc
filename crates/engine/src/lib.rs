//! Conversion admission and lifecycle engine.
//!
//! ## Components
//!
//! - [`QuotaLedger`]: quota reads/administration and the atomic
//!   check-and-reserve (delegated to the store's create)
//! - [`AdmissionController`]: rate limit, image access, request shape and
//!   quota as one admit/reject decision
//! - [`ConversionLifecycle`]: the state machine and `process_conversion`
//! - [`JobDispatcher`]: fire-and-forget hand-off to the worker queue
//! - [`ConversionWorker`]: drains the queue with bounded concurrency
//! - [`WatchEngine`]: long-poll until terminal or deadline
//! - [`ConversionService`]: the exposed operations

pub mod admission;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod quota;
pub mod service;
pub mod watch;
pub mod worker;

pub use admission::{AdmissionController, AdmissionRequest};
pub use dispatcher::JobDispatcher;
pub use error::{ConversionError, ConversionResult};
pub use lifecycle::{ConversionLifecycle, PROCESSING_CANCELLED_MESSAGE, Sinks};
pub use quota::QuotaLedger;
pub use service::{Collaborators, ConversionService};
pub use watch::{WatchEngine, WatchOptions};
pub use worker::{ConversionWorker, WorkOutcome, WorkerHandle, WorkerStats};
