use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use fitswap_conversions::{
    ConversionFilter, ConversionPage, ConversionRecord, ConversionStatus, ConversionUpdate,
    NewConversion, Pagination, QuotaAccount, QuotaState,
};
use fitswap_core::{ConversionId, UserId};

use super::r#trait::{ConversionStore, CreatedConversion, StoreError};

/// Account terms for users that have no quota account yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaDefaults {
    #[serde(default = "default_plan")]
    pub plan: String,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u32,
}

fn default_plan() -> String {
    "free".to_string()
}

fn default_monthly_limit() -> u32 {
    3
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            plan: default_plan(),
            monthly_limit: default_monthly_limit(),
        }
    }
}

/// In-memory conversion store for tests/dev.
///
/// Lock order is always `accounts` then `records`; no lock is held across an
/// await point.
#[derive(Debug, Default)]
pub struct InMemoryConversionStore {
    defaults: QuotaDefaults,
    accounts: RwLock<HashMap<UserId, QuotaAccount>>,
    records: RwLock<HashMap<ConversionId, ConversionRecord>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

impl InMemoryConversionStore {
    pub fn new(defaults: QuotaDefaults) -> Self {
        Self {
            defaults,
            accounts: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(defaults: QuotaDefaults) -> Arc<Self> {
        Arc::new(Self::new(defaults))
    }

    /// Seed or replace a user's quota account.
    pub fn set_account(&self, user_id: UserId, account: QuotaAccount) -> Result<(), StoreError> {
        let mut accounts = self.accounts.write().map_err(poisoned)?;
        accounts.insert(user_id, account);
        Ok(())
    }

    fn default_account(&self) -> QuotaAccount {
        QuotaAccount::new(self.defaults.plan.clone(), self.defaults.monthly_limit, Utc::now())
    }

    fn with_account<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut QuotaAccount) -> T,
    ) -> Result<T, StoreError> {
        let mut accounts = self.accounts.write().map_err(poisoned)?;
        let account = accounts
            .entry(user_id)
            .or_insert_with(|| self.default_account());
        account.roll_period(Utc::now());
        Ok(f(account))
    }
}

#[async_trait]
impl ConversionStore for InMemoryConversionStore {
    async fn create_conversion(&self, new: NewConversion) -> Result<CreatedConversion, StoreError> {
        let now = Utc::now();

        // Both locks are taken before anything is consumed so the quota charge
        // and the insert land together or not at all.
        let mut accounts = self.accounts.write().map_err(poisoned)?;
        let mut records = self.records.write().map_err(poisoned)?;

        let account = accounts
            .entry(new.user_id)
            .or_insert_with(|| self.default_account());
        account.roll_period(now);

        let Some(charged) = account.try_consume() else {
            return Err(StoreError::QuotaExceeded(account.state()));
        };

        let record = ConversionRecord::new(ConversionId::new(), new, now);
        records.insert(record.id, record.clone());

        Ok(CreatedConversion {
            record,
            charged,
            quota: account.state(),
        })
    }

    async fn get_conversion(&self, id: ConversionId) -> Result<ConversionRecord, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn update_conversion(
        &self,
        id: ConversionId,
        update: ConversionUpdate,
    ) -> Result<ConversionRecord, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if current.status != update.expected_status {
            return Err(StoreError::StatusConflict {
                id,
                expected: update.expected_status,
                actual: current.status,
            });
        }
        if let Some(next) = update.status {
            if !current.status.can_transition_to(next) {
                return Err(StoreError::InvalidUpdate(format!(
                    "illegal transition {} -> {}",
                    current.status, next
                )));
            }
        }

        let mut next = current.clone();
        next.apply_update(&update);
        next.check_invariants()
            .map_err(|e| StoreError::InvalidUpdate(e.to_string()))?;

        *current = next.clone();
        Ok(next)
    }

    async fn list_conversions(
        &self,
        filter: &ConversionFilter,
        pagination: Pagination,
    ) -> Result<ConversionPage, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let matching: Vec<_> = records
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(ConversionPage::paginate(matching, pagination))
    }

    async fn delete_conversion(
        &self,
        id: ConversionId,
        expected_status: ConversionStatus,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records.get(&id).ok_or(StoreError::NotFound(id))?;
        if current.status != expected_status {
            return Err(StoreError::StatusConflict {
                id,
                expected: expected_status,
                actual: current.status,
            });
        }
        records.remove(&id);
        Ok(())
    }

    async fn check_user_quota(&self, user_id: UserId) -> Result<QuotaState, StoreError> {
        let accounts = self.accounts.read().map_err(poisoned)?;
        let mut account = accounts
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| self.default_account());
        account.roll_period(Utc::now());
        Ok(account.state())
    }

    async fn grant_paid_credits(&self, user_id: UserId, credits: u32) -> Result<QuotaState, StoreError> {
        self.with_account(user_id, |account| {
            account.grant_paid(credits);
            account.state()
        })
    }

    async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        monthly_limit: u32,
    ) -> Result<QuotaState, StoreError> {
        self.with_account(user_id, |account| {
            account.plan = plan.to_string();
            account.monthly_limit = monthly_limit;
            account.state()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitswap_conversions::{ConversionTransition, QuotaUnit};
    use fitswap_core::ImageId;

    fn new_conversion(user: UserId) -> NewConversion {
        NewConversion::new(user, ImageId::new(), ImageId::new(), Some("casual".into()))
    }

    fn store_with_limit(limit: u32) -> InMemoryConversionStore {
        InMemoryConversionStore::new(QuotaDefaults {
            plan: "free".into(),
            monthly_limit: limit,
        })
    }

    #[tokio::test]
    async fn create_consumes_quota_and_inserts_pending() {
        let store = store_with_limit(2);
        let user = UserId::new();

        let created = store.create_conversion(new_conversion(user)).await.unwrap();
        assert_eq!(created.record.status, ConversionStatus::Pending);
        assert_eq!(created.charged, QuotaUnit::Free);
        assert_eq!(created.quota.remaining_free, 1);

        let fetched = store.get_conversion(created.record.id).await.unwrap();
        assert_eq!(fetched, created.record);
    }

    #[tokio::test]
    async fn exhausted_quota_creates_nothing() {
        let store = store_with_limit(1);
        let user = UserId::new();
        store.create_conversion(new_conversion(user)).await.unwrap();

        let err = store.create_conversion(new_conversion(user)).await.unwrap_err();
        match err {
            StoreError::QuotaExceeded(state) => {
                assert_eq!(state.remaining_free, 0);
                assert_eq!(state.remaining_paid, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let page = store
            .list_conversions(&ConversionFilter::for_user(user), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn paid_credits_extend_quota() {
        let store = store_with_limit(0);
        let user = UserId::new();

        assert!(store.create_conversion(new_conversion(user)).await.is_err());
        let state = store.grant_paid_credits(user, 1).await.unwrap();
        assert_eq!(state.remaining_paid, 1);

        let created = store.create_conversion(new_conversion(user)).await.unwrap();
        assert_eq!(created.charged, QuotaUnit::Paid);
    }

    #[tokio::test]
    async fn update_is_guarded_by_expected_status() {
        let store = store_with_limit(5);
        let created = store.create_conversion(new_conversion(UserId::new())).await.unwrap();
        let record = created.record;

        let start = record
            .plan_transition(&ConversionTransition::StartProcessing, Utc::now())
            .unwrap();
        let processing = store.update_conversion(record.id, start.clone()).await.unwrap();
        assert_eq!(processing.status, ConversionStatus::Processing);

        // Same patch again: the stored status moved on.
        let err = store.update_conversion(record.id, start).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusConflict {
                expected: ConversionStatus::Pending,
                actual: ConversionStatus::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn update_rejects_patches_that_break_invariants() {
        let store = store_with_limit(5);
        let record = store
            .create_conversion(new_conversion(UserId::new()))
            .await
            .unwrap()
            .record;

        let mut bogus = record
            .plan_transition(&ConversionTransition::StartProcessing, Utc::now())
            .unwrap();
        bogus.error_message = Some("stray".into());

        let err = store.update_conversion(record.id, bogus).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
        let unchanged = store.get_conversion(record.id).await.unwrap();
        assert_eq!(unchanged.status, ConversionStatus::Pending);
    }

    #[tokio::test]
    async fn delete_is_guarded_and_reports_missing() {
        let store = store_with_limit(5);
        let record = store
            .create_conversion(new_conversion(UserId::new()))
            .await
            .unwrap()
            .record;

        let err = store
            .delete_conversion(record.id, ConversionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));

        store
            .delete_conversion(record.id, ConversionStatus::Pending)
            .await
            .unwrap();
        assert!(matches!(
            store.get_conversion(record.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn quota_check_does_not_create_accounts() {
        let store = store_with_limit(4);
        let user = UserId::new();

        let state = store.check_user_quota(user).await.unwrap();
        assert_eq!(state.plan, "free");
        assert_eq!(state.remaining_free, 4);
        assert!(store.accounts.read().unwrap().is_empty());

        let state = store.set_plan(user, "pro", 50).await.unwrap();
        assert_eq!(state.plan, "pro");
        assert_eq!(state.remaining_free, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_never_oversell() {
        let store = Arc::new(store_with_limit(3));
        let user = UserId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create_conversion(new_conversion(user)).await })
            })
            .collect();

        let mut admitted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(StoreError::QuotaExceeded(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(rejected, 5);
    }
}
