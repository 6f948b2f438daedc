//! One-way side-effect sinks: notifications, audit and metrics.
//!
//! Every sink method returns `()`. Callers fire, the sink observes (logs its
//! own failures), and the outcome is discarded; nothing a sink does can change
//! the result of the operation that triggered it.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fitswap_core::{ConversionId, UserId};

use crate::retry::{Classify, ErrorClass, RetryExecutor};

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionNotice {
    pub conversion_id: ConversionId,
    pub user_id: UserId,
    pub kind: NoticeKind,
    /// Failure reason for `Failed`.
    pub detail: Option<String>,
}

impl ConversionNotice {
    pub fn new(conversion_id: ConversionId, user_id: UserId, kind: NoticeKind) -> Self {
        Self {
            conversion_id,
            user_id,
            kind,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Best-effort notification sink.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notice: ConversionNotice);
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("notification channel unavailable: {0}")]
    Transient(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl Classify for ChannelError {
    fn error_class(&self) -> Option<ErrorClass> {
        Some(match self {
            ChannelError::Transient(_) => ErrorClass::Retryable,
            ChannelError::Rejected(_) => ErrorClass::Terminal,
        })
    }
}

/// A fallible delivery channel (email, push, webhook).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, notice: &ConversionNotice) -> Result<(), ChannelError>;
}

/// Delivers through a [`NotificationChannel`] under the `"notifier"` retry
/// policy and logs whatever is left over.
pub struct RetryingNotifier<C> {
    channel: C,
    retry: RetryExecutor,
    cancel: CancellationToken,
}

impl<C: NotificationChannel> RetryingNotifier<C> {
    pub const POLICY: &'static str = "notifier";

    pub fn new(channel: C, retry: RetryExecutor) -> Self {
        Self {
            channel,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon pending retries when `cancel` fires (e.g. on shutdown).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl<C: NotificationChannel> NotificationSink for RetryingNotifier<C> {
    async fn notify(&self, notice: ConversionNotice) {
        let result = self
            .retry
            .execute(Self::POLICY, &self.cancel, |_| self.channel.send(&notice))
            .await;

        if let Err(e) = result {
            warn!(
                conversion_id = %notice.conversion_id,
                kind = ?notice.kind,
                attempts = e.attempts(),
                error = %e,
                "notification dropped"
            );
        }
    }
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, notice: ConversionNotice) {
        info!(
            target: "notifications",
            conversion_id = %notice.conversion_id,
            user_id = %notice.user_id,
            kind = ?notice.kind,
            detail = notice.detail.as_deref().unwrap_or(""),
            "conversion notice"
        );
    }
}

/// Collects notices for assertions.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    notices: Mutex<Vec<ConversionNotice>>,
}

impl InMemoryNotifier {
    pub fn notices(&self) -> Vec<ConversionNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotifier {
    async fn notify(&self, notice: ConversionNotice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ConversionCreated,
    ConversionUpdated,
    ConversionDeleted,
    ConversionCancelled,
    ConversionCompleted,
    ConversionFailed,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::ConversionCreated => "conversion.created",
            AuditAction::ConversionUpdated => "conversion.updated",
            AuditAction::ConversionDeleted => "conversion.deleted",
            AuditAction::ConversionCancelled => "conversion.cancelled",
            AuditAction::ConversionCompleted => "conversion.completed",
            AuditAction::ConversionFailed => "conversion.failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub user_id: UserId,
    pub conversion_id: ConversionId,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, user_id: UserId, conversion_id: ConversionId) -> Self {
        Self {
            action,
            user_id,
            conversion_id,
            metadata: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Best-effort audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

/// Emits audit entries on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditSink for TracingAuditLog {
    async fn record(&self, entry: AuditEntry) {
        info!(
            target: "audit",
            action = entry.action.as_str(),
            user_id = %entry.user_id,
            conversion_id = %entry.conversion_id,
            metadata = %entry.metadata,
            "audit"
        );
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, entry: AuditEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Conversion counters. Synchronous and infallible.
pub trait MetricsSink: Send + Sync {
    fn conversion_started(&self);
    fn conversion_completed(&self, processing_time_ms: u64);
    fn conversion_failed(&self);
    fn admission_rejected(&self, reason: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub processing_time_ms_total: u64,
    pub rejected: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn rejected_for(&self, reason: &str) -> u64 {
        self.rejected.get(reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    processing_time_ms_total: AtomicU64,
    rejected: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            processing_time_ms_total: self.processing_time_ms_total.load(Ordering::Relaxed),
            rejected: self.rejected.lock().map(|r| r.clone()).unwrap_or_default(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn conversion_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn conversion_completed(&self, processing_time_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.processing_time_ms_total
            .fetch_add(processing_time_ms, Ordering::Relaxed);
    }

    fn conversion_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn admission_rejected(&self, reason: &str) {
        match self.rejected.lock() {
            Ok(mut rejected) => *rejected.entry(reason.to_string()).or_insert(0) += 1,
            Err(_) => debug!(reason, "metrics lock poisoned; rejection not counted"),
        }
    }
}
