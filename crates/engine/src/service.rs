//! Exposed operations, wired by constructor injection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fitswap_conversions::{
    ConversionFilter, ConversionPage, ConversionRecord, ConversionStatus, ConversionStatusView,
    ConversionUpdate, Pagination, QuotaState,
};
use fitswap_core::{ConversionId, UserId};
use fitswap_infra::{
    AuditAction, AuditEntry, AuditSink, ConfigError, ConversionNotice, ConversionStore, CreatedConversion,
    FitswapConfig, ImageService, MetricsSink, NoticeKind, NotificationSink, Processor,
    RateLimiter, RetryExecutor, StoreError, WatchConfig, WorkQueue,
};

use crate::admission::{AdmissionController, AdmissionRequest};
use crate::dispatcher::JobDispatcher;
use crate::error::{ConversionError, ConversionResult};
use crate::lifecycle::{ConversionLifecycle, Sinks};
use crate::quota::QuotaLedger;
use crate::watch::{WatchEngine, WatchOptions};
use crate::worker::ConversionWorker;

/// The collaborators the engine is composed from.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ConversionStore>,
    pub images: Arc<dyn ImageService>,
    pub processor: Arc<dyn Processor>,
    pub queue: Arc<dyn WorkQueue>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub notifier: Arc<dyn NotificationSink>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Facade over admission, lifecycle, dispatch and watch.
///
/// Every operation that takes a `user_id` is owner-scoped: another user's
/// record is reported as [`ConversionError::NotFound`].
pub struct ConversionService {
    store: Arc<dyn ConversionStore>,
    admission: AdmissionController,
    ledger: QuotaLedger,
    lifecycle: Arc<ConversionLifecycle>,
    dispatcher: JobDispatcher,
    watch: WatchEngine,
    watch_config: WatchConfig,
    sinks: Sinks,
}

impl ConversionService {
    /// Rejects a configuration that fails [`FitswapConfig::validate`].
    pub fn new(collaborators: Collaborators, config: &FitswapConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let Collaborators {
            store,
            images,
            processor,
            queue,
            rate_limiter,
            notifier,
            audit,
            metrics,
        } = collaborators;

        let retry = RetryExecutor::new(config.retry.clone());
        let sinks = Sinks {
            notifier,
            audit,
            metrics,
        };
        let ledger = QuotaLedger::new(store.clone());

        Ok(Self {
            admission: AdmissionController::new(rate_limiter, images, ledger.clone(), retry.clone()),
            ledger,
            lifecycle: Arc::new(ConversionLifecycle::new(
                store.clone(),
                processor,
                retry.clone(),
                sinks.clone(),
            )),
            dispatcher: JobDispatcher::new(queue, retry),
            watch: WatchEngine::new(store.clone(), config.watch.grace()),
            watch_config: config.watch.clone(),
            store,
            sinks,
        })
    }

    /// The state machine, for the worker-facing processing path.
    pub fn lifecycle(&self) -> Arc<ConversionLifecycle> {
        self.lifecycle.clone()
    }

    /// A worker that processes what this service dispatches.
    pub fn worker(&self, config: &FitswapConfig) -> ConversionWorker {
        ConversionWorker::new(self.lifecycle.clone(), self.store.clone(), config.worker.clone())
    }

    /// Admit and create a conversion, then dispatch it.
    ///
    /// Everything after creation is best-effort and cannot change the result.
    pub async fn create(
        &self,
        user_id: UserId,
        request: AdmissionRequest,
        cancel: &CancellationToken,
    ) -> ConversionResult<CreatedConversion> {
        let created = match self.admission.admit(user_id, request, cancel).await {
            Ok(created) => created,
            Err(e) => {
                if e.is_admission_rejection() {
                    info!(user_id = %user_id, reason = e.code(), error = %e, "conversion rejected");
                    self.sinks.metrics.admission_rejected(e.code());
                }
                return Err(e);
            }
        };

        let record = &created.record;
        self.sinks.metrics.conversion_started();
        self.sinks
            .audit
            .record(
                AuditEntry::new(AuditAction::ConversionCreated, user_id, record.id).with_metadata(
                    json!({
                        "charged": created.charged,
                        "source_image_id": record.source_image_id,
                        "target_image_id": record.target_image_id,
                        "style": record.style,
                    }),
                ),
            )
            .await;
        self.sinks
            .notifier
            .notify(ConversionNotice::new(record.id, user_id, NoticeKind::Started))
            .await;
        self.dispatcher.dispatch(record.id).await;

        Ok(created)
    }

    pub async fn get(&self, id: ConversionId, user_id: UserId) -> ConversionResult<ConversionRecord> {
        let record = self.store.get_conversion(id).await?;
        if !record.is_owned_by(user_id) {
            return Err(ConversionError::NotFound(id));
        }
        Ok(record)
    }

    pub async fn get_status(
        &self,
        id: ConversionId,
        user_id: UserId,
    ) -> ConversionResult<ConversionStatusView> {
        Ok(self.get(id, user_id).await?.status_view())
    }

    /// Newest first; the filter's owner scopes the listing.
    pub async fn list(
        &self,
        filter: &ConversionFilter,
        pagination: Pagination,
    ) -> ConversionResult<ConversionPage> {
        Ok(self.store.list_conversions(filter, pagination).await?)
    }

    /// Change the style label of a `pending` conversion.
    pub async fn update(
        &self,
        id: ConversionId,
        user_id: UserId,
        style: Option<String>,
    ) -> ConversionResult<ConversionRecord> {
        let current = self.get(id, user_id).await?;
        if current.status != ConversionStatus::Pending {
            return Err(ConversionError::InvalidRequest(format!(
                "only pending conversions can be edited (status: {})",
                current.status
            )));
        }

        let update = ConversionUpdate::restyle(style, Utc::now())?;
        let record = self
            .store
            .update_conversion(id, update)
            .await
            .map_err(|e| match e {
                StoreError::StatusConflict { actual, .. } => ConversionError::InvalidRequest(format!(
                    "only pending conversions can be edited (status: {actual})"
                )),
                other => other.into(),
            })?;

        self.sinks
            .audit
            .record(
                AuditEntry::new(AuditAction::ConversionUpdated, user_id, id)
                    .with_metadata(json!({ "style": record.style })),
            )
            .await;
        Ok(record)
    }

    /// Delete a conversion that is not being processed.
    pub async fn delete(&self, id: ConversionId, user_id: UserId) -> ConversionResult<()> {
        let current = self.get(id, user_id).await?;
        if current.status == ConversionStatus::Processing {
            return Err(ConversionError::InvalidRequest(
                "conversion is being processed and cannot be deleted".into(),
            ));
        }

        self.store
            .delete_conversion(id, current.status)
            .await
            .map_err(|e| match e {
                StoreError::StatusConflict { actual, .. } => ConversionError::InvalidRequest(format!(
                    "conversion changed while deleting (status: {actual})"
                )),
                other => other.into(),
            })?;

        debug!(conversion_id = %id, user_id = %user_id, "conversion deleted");
        self.sinks
            .audit
            .record(
                AuditEntry::new(AuditAction::ConversionDeleted, user_id, id)
                    .with_metadata(json!({ "status": current.status })),
            )
            .await;
        Ok(())
    }

    pub async fn cancel(&self, id: ConversionId, user_id: UserId) -> ConversionResult<ConversionRecord> {
        self.lifecycle.cancel(id, user_id).await
    }

    /// Long-poll until terminal or `timeout`. Parameters are clamped to the
    /// configured bounds.
    pub async fn watch(
        &self,
        id: ConversionId,
        user_id: UserId,
        timeout: Option<Duration>,
        poll_interval: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ConversionResult<ConversionRecord> {
        let options = WatchOptions::clamped(timeout, poll_interval, &self.watch_config);
        self.watch.watch(id, user_id, options, cancel).await
    }

    pub async fn quota(&self, user_id: UserId) -> ConversionResult<QuotaState> {
        self.ledger.remaining(user_id).await
    }

    pub async fn grant_paid_credits(&self, user_id: UserId, credits: u32) -> ConversionResult<QuotaState> {
        self.ledger.grant_paid_credits(user_id, credits).await
    }

    pub async fn set_plan(
        &self,
        user_id: UserId,
        plan: &str,
        monthly_limit: u32,
    ) -> ConversionResult<QuotaState> {
        self.ledger.set_plan(user_id, plan, monthly_limit).await
    }
}
