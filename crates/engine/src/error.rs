//! Caller-facing error taxonomy.

use std::time::Duration;

use thiserror::Error;

use fitswap_conversions::{ConversionStatus, IllegalTransition};
use fitswap_core::{ConversionId, DomainError};
use fitswap_infra::{RateLimited, StoreError};

/// Everything an engine operation can report to its caller.
///
/// Admission rejections carry enough structure to render a precise message;
/// [`is_transient`](Self::is_transient) separates "retry the same request"
/// from "change behaviour".
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("rate limit of {limit} requests exceeded; retry in {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration, limit: u32 },

    #[error("quota exceeded on plan '{plan}' (remaining free: {remaining_free}, paid: {remaining_paid})")]
    QuotaExceeded {
        plan: String,
        remaining_free: u32,
        remaining_paid: u32,
    },

    /// An image id does not resolve.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Unknown, or owned by someone else.
    #[error("conversion not found: {0}")]
    NotFound(ConversionId),

    /// A state-machine violation; indicates a bug, not bad input.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: ConversionStatus,
        to: ConversionStatus,
    },

    #[error("retries exhausted after {attempts} attempt(s): {message}")]
    RetryExhausted { attempts: u32, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(StoreError),
}

impl ConversionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ConversionError::RateLimited { .. } => "rate_limited",
            ConversionError::QuotaExceeded { .. } => "quota_exceeded",
            ConversionError::InvalidImage(_) => "invalid_image",
            ConversionError::InvalidRequest(_) => "invalid_request",
            ConversionError::AccessDenied(_) => "access_denied",
            ConversionError::NotFound(_) => "not_found",
            ConversionError::InvalidTransition { .. } => "invalid_transition",
            ConversionError::RetryExhausted { .. } => "retry_exhausted",
            ConversionError::Cancelled => "cancelled",
            ConversionError::Store(_) => "store_error",
        }
    }

    /// Whether repeating the identical request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConversionError::RetryExhausted { .. }
                | ConversionError::Cancelled
                | ConversionError::Store(StoreError::Storage(_))
        )
    }

    /// Rejected at the admission gate; nothing was created or charged.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            ConversionError::RateLimited { .. }
                | ConversionError::QuotaExceeded { .. }
                | ConversionError::InvalidImage(_)
                | ConversionError::InvalidRequest(_)
                | ConversionError::AccessDenied(_)
        )
    }
}

impl From<StoreError> for ConversionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(id) => ConversionError::NotFound(id),
            StoreError::QuotaExceeded(state) => ConversionError::QuotaExceeded {
                plan: state.plan,
                remaining_free: state.remaining_free,
                remaining_paid: state.remaining_paid,
            },
            StoreError::StatusConflict { id, actual, .. } => ConversionError::InvalidRequest(
                format!("conversion {id} changed concurrently and is now {actual}"),
            ),
            other => ConversionError::Store(other),
        }
    }
}

impl From<IllegalTransition> for ConversionError {
    fn from(value: IllegalTransition) -> Self {
        ConversionError::InvalidTransition {
            from: value.from,
            to: value.to,
        }
    }
}

impl From<DomainError> for ConversionError {
    fn from(value: DomainError) -> Self {
        ConversionError::InvalidRequest(value.to_string())
    }
}

impl From<RateLimited> for ConversionError {
    fn from(value: RateLimited) -> Self {
        ConversionError::RateLimited {
            retry_after: value.retry_after,
            limit: value.limit,
        }
    }
}

pub type ConversionResult<T> = Result<T, ConversionError>;
