use async_trait::async_trait;
use thiserror::Error;

use fitswap_conversions::{
    ConversionFilter, ConversionPage, ConversionRecord, ConversionStatus, ConversionUpdate,
    NewConversion, Pagination, QuotaState, QuotaUnit,
};
use fitswap_core::{ConversionId, UserId};

use crate::retry::{Classify, ErrorClass};

/// Store operation error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("conversion not found: {0}")]
    NotFound(ConversionId),

    /// No free or paid units remain; carries the state that was checked.
    #[error("quota exceeded (remaining free: {}, paid: {})", .0.remaining_free, .0.remaining_paid)]
    QuotaExceeded(QuotaState),

    /// The stored status no longer matches the caller's expectation.
    #[error("conversion {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: ConversionId,
        expected: ConversionStatus,
        actual: ConversionStatus,
    },

    /// The patch would leave the record in an inconsistent state.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Classify for StoreError {
    fn error_class(&self) -> Option<ErrorClass> {
        match self {
            StoreError::Storage(_) => None,
            _ => Some(ErrorClass::Terminal),
        }
    }
}

/// Outcome of an admitted creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedConversion {
    pub record: ConversionRecord,
    /// Which allowance paid for it.
    pub charged: QuotaUnit,
    /// Quota after the reservation.
    pub quota: QuotaState,
}

/// Persistence for conversions and per-user quota.
#[async_trait]
pub trait ConversionStore: Send + Sync {
    /// Check remaining quota, consume one unit and insert a `pending` record,
    /// atomically. Fails with [`StoreError::QuotaExceeded`] and no side effects
    /// when nothing remains.
    async fn create_conversion(&self, new: NewConversion) -> Result<CreatedConversion, StoreError>;

    async fn get_conversion(&self, id: ConversionId) -> Result<ConversionRecord, StoreError>;

    /// Apply `update` if the stored status equals `update.expected_status`.
    async fn update_conversion(
        &self,
        id: ConversionId,
        update: ConversionUpdate,
    ) -> Result<ConversionRecord, StoreError>;

    async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        pagination: Pagination,
    ) -> Result<ConversionPage, StoreError>;

    /// Delete the record if its stored status equals `expected_status`.
    async fn delete_conversion(
        &self,
        id: ConversionId,
        expected_status: ConversionStatus,
    ) -> Result<(), StoreError>;

    async fn check_user_quota(&self, user_id: UserId) -> Result<QuotaState, StoreError>;

    /// Add lifetime paid credits to a user's account.
    async fn grant_paid_credits(&self, user_id: UserId, credits: u32) -> Result<QuotaState, StoreError>;

    /// Change a user's plan and monthly free allowance.
    async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        monthly_limit: u32,
    ) -> Result<QuotaState, StoreError>;
}
