//! Conversion state machine and the processing orchestration.
//!
//! All record mutation goes through [`ConversionLifecycle::transition`]: plan
//! the patch against the current state, then apply it with a compare-and-set
//! on the expected status. A lost race re-plans against the fresh record, so
//! concurrent writers are serialised by the store and an illegal move is
//! reported as [`ConversionError::InvalidTransition`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fitswap_conversions::{ConversionRecord, ConversionStatus, ConversionTransition};
use fitswap_core::{ConversionId, UserId};
use fitswap_infra::{
    AuditAction, AuditEntry, AuditSink, ConversionNotice, ConversionStore, MetricsSink,
    NoticeKind, NotificationSink, ProcessRequest, Processor, RetryError, RetryExecutor,
    StoreError,
};

use crate::error::{ConversionError, ConversionResult};

const PROCESSOR_POLICY: &str = "processor";
const MAX_CAS_ATTEMPTS: u32 = 3;

/// Failure text recorded when processing is abandoned by shutdown.
pub const PROCESSING_CANCELLED_MESSAGE: &str = "processing cancelled";

/// Side-effect sinks shared by the lifecycle and the service.
#[derive(Clone)]
pub struct Sinks {
    pub notifier: Arc<dyn NotificationSink>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct ConversionLifecycle {
    store: Arc<dyn ConversionStore>,
    processor: Arc<dyn Processor>,
    retry: RetryExecutor,
    sinks: Sinks,
}

impl ConversionLifecycle {
    pub fn new(
        store: Arc<dyn ConversionStore>,
        processor: Arc<dyn Processor>,
        retry: RetryExecutor,
        sinks: Sinks,
    ) -> Self {
        Self {
            store,
            processor,
            retry,
            sinks,
        }
    }

    /// Apply `transition` to the stored record.
    pub async fn transition(
        &self,
        id: ConversionId,
        transition: &ConversionTransition,
    ) -> ConversionResult<ConversionRecord> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.get_conversion(id).await?;
            let update = current
                .plan_transition(transition, Utc::now())
                .map_err(|e| {
                    error!(conversion_id = %id, from = %e.from, to = %e.to, "illegal transition requested");
                    ConversionError::from(e)
                })?;

            match self.store.update_conversion(id, update).await {
                Ok(record) => {
                    debug!(
                        conversion_id = %id,
                        from = %current.status,
                        to = %record.status,
                        "conversion transitioned"
                    );
                    return Ok(record);
                }
                Err(StoreError::StatusConflict { actual, .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    debug!(conversion_id = %id, actual = %actual, "transition raced, re-planning");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Owner cancellation: `pending → failed` with the cancellation message.
    pub async fn cancel(&self, id: ConversionId, user_id: UserId) -> ConversionResult<ConversionRecord> {
        let current = self.store.get_conversion(id).await?;
        if !current.is_owned_by(user_id) {
            return Err(ConversionError::NotFound(id));
        }
        if current.status != ConversionStatus::Pending {
            return Err(ConversionError::InvalidRequest(format!(
                "only pending conversions can be cancelled (status: {})",
                current.status
            )));
        }

        let update = current.plan_transition(&ConversionTransition::cancel(), Utc::now())?;
        let record = self.store.update_conversion(id, update).await.map_err(|e| match e {
            StoreError::StatusConflict { actual, .. } => ConversionError::InvalidRequest(format!(
                "only pending conversions can be cancelled (status: {actual})"
            )),
            other => other.into(),
        })?;

        info!(conversion_id = %id, user_id = %user_id, "conversion cancelled");
        self.sinks
            .audit
            .record(AuditEntry::new(AuditAction::ConversionCancelled, user_id, id))
            .await;
        self.notify(&record, NoticeKind::Failed).await;
        Ok(record)
    }

    /// Drive an admitted record to a terminal state.
    ///
    /// Processor failures, including exhausted retries and cancellation, end
    /// in a `failed` record (returned as `Ok`) carrying the underlying message
    /// verbatim. `Err` means the lifecycle itself could not be driven.
    pub async fn process_conversion(
        &self,
        id: ConversionId,
        cancel: &CancellationToken,
    ) -> ConversionResult<ConversionRecord> {
        let record = self.transition(id, &ConversionTransition::StartProcessing).await?;
        let request = ProcessRequest {
            conversion_id: record.id,
            source_image_id: record.source_image_id,
            target_image_id: record.target_image_id,
            style: record.style.clone(),
        };

        let started = Instant::now();
        let outcome = self
            .retry
            .execute(PROCESSOR_POLICY, cancel, |attempt| {
                debug!(conversion_id = %id, attempt, "invoking processor");
                self.processor.process(&request)
            })
            .await;

        match outcome {
            Ok(result_image_id) => {
                let processing_time_ms = started.elapsed().as_millis() as u64;
                let record = self
                    .transition(
                        id,
                        &ConversionTransition::Complete {
                            result_image_id,
                            processing_time_ms,
                        },
                    )
                    .await?;

                info!(conversion_id = %id, processing_time_ms, "conversion completed");
                self.sinks.metrics.conversion_completed(processing_time_ms);
                self.notify(&record, NoticeKind::Completed).await;
                self.sinks
                    .audit
                    .record(
                        AuditEntry::new(AuditAction::ConversionCompleted, record.user_id, id)
                            .with_metadata(json!({ "processing_time_ms": processing_time_ms })),
                    )
                    .await;
                Ok(record)
            }
            Err(e) => {
                let attempts = e.attempts();
                let message = failure_message(e);
                warn!(conversion_id = %id, attempts, error = %message, "conversion failed");

                let record = self
                    .transition(
                        id,
                        &ConversionTransition::Fail {
                            error_message: message.clone(),
                        },
                    )
                    .await?;

                self.sinks.metrics.conversion_failed();
                self.notify(&record, NoticeKind::Failed).await;
                self.sinks
                    .audit
                    .record(
                        AuditEntry::new(AuditAction::ConversionFailed, record.user_id, id)
                            .with_metadata(json!({ "attempts": attempts, "error": message })),
                    )
                    .await;
                Ok(record)
            }
        }
    }

    async fn notify(&self, record: &ConversionRecord, kind: NoticeKind) {
        let mut notice = ConversionNotice::new(record.id, record.user_id, kind);
        if let Some(message) = &record.error_message {
            notice = notice.with_detail(message.clone());
        }
        self.sinks.notifier.notify(notice).await;
    }
}

fn failure_message<E: std::error::Error + 'static>(error: RetryError<E>) -> String {
    if error.is_cancelled() {
        return PROCESSING_CANCELLED_MESSAGE.to_string();
    }
    error
        .into_last_error()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fitswap_conversions::{CANCELLED_MESSAGE, NewConversion};
    use fitswap_core::ImageId;
    use fitswap_infra::{
        InMemoryAuditLog, InMemoryConversionStore, InMemoryMetrics, InMemoryNotifier,
        ProcessorError, QuotaDefaults, RetryPolicies, RetryPolicy, ScriptedProcessor,
    };

    struct Fixture {
        lifecycle: ConversionLifecycle,
        store: Arc<InMemoryConversionStore>,
        processor: Arc<ScriptedProcessor>,
        metrics: Arc<InMemoryMetrics>,
        audit: Arc<InMemoryAuditLog>,
        notifier: Arc<InMemoryNotifier>,
    }

    fn fixture(processor: ScriptedProcessor) -> Fixture {
        let store = InMemoryConversionStore::arc(QuotaDefaults {
            plan: "free".into(),
            monthly_limit: 10,
        });
        let processor = Arc::new(processor);
        let metrics = Arc::new(InMemoryMetrics::default());
        let audit = Arc::new(InMemoryAuditLog::default());
        let notifier = Arc::new(InMemoryNotifier::default());
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(false);
        let lifecycle = ConversionLifecycle::new(
            store.clone(),
            processor.clone(),
            RetryExecutor::new(RetryPolicies::new(RetryPolicy::no_retry()).with_policy("processor", policy)),
            Sinks {
                notifier: notifier.clone(),
                audit: audit.clone(),
                metrics: metrics.clone(),
            },
        );
        Fixture {
            lifecycle,
            store,
            processor,
            metrics,
            audit,
            notifier,
        }
    }

    async fn pending(f: &Fixture, user: UserId) -> ConversionRecord {
        f.store
            .create_conversion(NewConversion::new(user, ImageId::new(), ImageId::new(), None))
            .await
            .unwrap()
            .record
    }

    #[tokio::test(start_paused = true)]
    async fn successful_processing_completes_the_record() {
        let f = fixture(ScriptedProcessor::succeeding().with_latency(Duration::from_millis(40)));
        let record = pending(&f, UserId::new()).await;

        let done = f
            .lifecycle
            .process_conversion(record.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, ConversionStatus::Completed);
        assert!(done.result_image_id.is_some());
        assert_eq!(done.processing_time_ms, Some(40));
        assert!(done.check_invariants().is_ok());
        assert_eq!(f.metrics.snapshot().completed, 1);
        assert_eq!(f.audit.actions(), vec![AuditAction::ConversionCompleted]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_the_underlying_message() {
        let f = fixture(ScriptedProcessor::always_failing(
            ProcessorError::Transient("gpu pool saturated".into()),
            10,
        ));
        let record = pending(&f, UserId::new()).await;

        let done = f
            .lifecycle
            .process_conversion(record.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.status, ConversionStatus::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some("processor temporarily unavailable: gpu pool saturated")
        );
        assert_eq!(f.processor.calls(), 3);
        assert_eq!(f.metrics.snapshot().failed, 1);
        assert_eq!(f.notifier.notices()[0].kind, NoticeKind::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_input_fails_after_one_attempt() {
        let f = fixture(ScriptedProcessor::failing_with([ProcessorError::Rejected(
            "no person detected".into(),
        )]));
        let record = pending(&f, UserId::new()).await;

        let done = f
            .lifecycle
            .process_conversion(record.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, ConversionStatus::Failed);
        assert_eq!(f.processor.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_fails_the_record() {
        let f = fixture(ScriptedProcessor::always_failing(
            ProcessorError::Transient("busy".into()),
            10,
        ));
        let record = pending(&f, UserId::new()).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let done = f.lifecycle.process_conversion(record.id, &cancel).await.unwrap();
        assert_eq!(done.error_message.as_deref(), Some(PROCESSING_CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn terminal_records_reject_further_transitions() {
        let f = fixture(ScriptedProcessor::succeeding());
        let record = pending(&f, UserId::new()).await;
        f.lifecycle
            .process_conversion(record.id, &CancellationToken::new())
            .await
            .unwrap();

        let err = f
            .lifecycle
            .transition(record.id, &ConversionTransition::StartProcessing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConversionError::InvalidTransition {
                from: ConversionStatus::Completed,
                to: ConversionStatus::Processing,
            }
        ));
    }

    #[tokio::test]
    async fn cancel_is_owner_only_and_pending_only() {
        let f = fixture(ScriptedProcessor::succeeding());
        let owner = UserId::new();
        let record = pending(&f, owner).await;

        let err = f.lifecycle.cancel(record.id, UserId::new()).await.unwrap_err();
        assert!(matches!(err, ConversionError::NotFound(_)));

        let cancelled = f.lifecycle.cancel(record.id, owner).await.unwrap();
        assert_eq!(cancelled.status, ConversionStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert_eq!(f.audit.actions(), vec![AuditAction::ConversionCancelled]);

        let err = f.lifecycle.cancel(record.id, owner).await.unwrap_err();
        assert!(matches!(err, ConversionError::InvalidRequest(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_transitions_apply_exactly_once() {
        let f = Arc::new(fixture(ScriptedProcessor::succeeding()));
        let record = pending(&f, UserId::new()).await;

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move {
                    f.lifecycle
                        .transition(record.id, &ConversionTransition::StartProcessing)
                        .await
                })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => applied += 1,
                Err(ConversionError::InvalidTransition { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(applied, 1);
    }
}
