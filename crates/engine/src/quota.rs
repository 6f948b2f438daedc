//! Per-user quota ledger.

use std::sync::Arc;

use tracing::{debug, info};

use fitswap_conversions::{NewConversion, QuotaState};
use fitswap_core::UserId;
use fitswap_infra::{ConversionStore, CreatedConversion};

use crate::error::{ConversionError, ConversionResult};

/// Quota reads, administration, and the check-and-reserve primitive.
///
/// Reservation is never a separate step: it happens inside the store's
/// atomic create, so two concurrent requests cannot both see the last unit.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn ConversionStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn ConversionStore>) -> Self {
        Self { store }
    }

    pub async fn remaining(&self, user_id: UserId) -> ConversionResult<QuotaState> {
        Ok(self.store.check_user_quota(user_id).await?)
    }

    /// Consume one unit and create the `pending` record, or reject with
    /// [`ConversionError::QuotaExceeded`] leaving nothing behind.
    pub async fn reserve_and_create(&self, new: NewConversion) -> ConversionResult<CreatedConversion> {
        let user_id = new.user_id;
        let created = self.store.create_conversion(new).await.map_err(|e| {
            debug!(user_id = %user_id, error = %e, "quota reservation rejected");
            ConversionError::from(e)
        })?;

        debug!(
            user_id = %user_id,
            conversion_id = %created.record.id,
            charged = ?created.charged,
            remaining = created.quota.total_remaining(),
            "quota unit reserved"
        );
        Ok(created)
    }

    pub async fn grant_paid_credits(&self, user_id: UserId, credits: u32) -> ConversionResult<QuotaState> {
        if credits == 0 {
            return Err(ConversionError::InvalidRequest(
                "credits to grant must be positive".into(),
            ));
        }
        let state = self.store.grant_paid_credits(user_id, credits).await?;
        info!(user_id = %user_id, credits, remaining_paid = state.remaining_paid, "paid credits granted");
        Ok(state)
    }

    pub async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        monthly_limit: u32,
    ) -> ConversionResult<QuotaState> {
        let plan = plan.trim();
        if plan.is_empty() {
            return Err(ConversionError::InvalidRequest("plan name must not be blank".into()));
        }
        let state = self.store.set_plan(user_id, plan, monthly_limit).await?;
        info!(user_id = %user_id, plan, monthly_limit, "plan changed");
        Ok(state)
    }
}
