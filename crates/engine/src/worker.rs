//! Background conversion worker.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fitswap_conversions::ConversionStatus;
use fitswap_core::ConversionId;
use fitswap_infra::{ConversionStore, StoreError, WorkReceiver, WorkerConfig};

use crate::error::{ConversionError, ConversionResult};
use crate::lifecycle::ConversionLifecycle;

/// What happened to one dequeued conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Succeeded,
    Failed,
    /// No longer `pending` (cancelled, deleted, or already picked up).
    Skipped,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Drains the work queue and runs each conversion through
/// [`ConversionLifecycle::process_conversion`], at most
/// `max_concurrent` at a time.
pub struct ConversionWorker {
    lifecycle: Arc<ConversionLifecycle>,
    store: Arc<dyn ConversionStore>,
    config: WorkerConfig,
}

impl ConversionWorker {
    pub fn new(
        lifecycle: Arc<ConversionLifecycle>,
        store: Arc<dyn ConversionStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            lifecycle,
            store,
            config,
        }
    }

    /// Process a single conversion (for testing or synchronous use).
    pub async fn execute_one(
        &self,
        id: ConversionId,
        cancel: &CancellationToken,
    ) -> ConversionResult<WorkOutcome> {
        let record = match self.store.get_conversion(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                debug!(worker = %self.config.name, conversion_id = %id, "conversion gone, skipping");
                return Ok(WorkOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if record.status != ConversionStatus::Pending {
            debug!(
                worker = %self.config.name,
                conversion_id = %id,
                status = %record.status,
                "conversion no longer pending, skipping"
            );
            return Ok(WorkOutcome::Skipped);
        }

        match self.lifecycle.process_conversion(id, cancel).await {
            Ok(done) if done.status == ConversionStatus::Completed => Ok(WorkOutcome::Succeeded),
            Ok(_) => Ok(WorkOutcome::Failed),
            // Cancelled or claimed between the check and the start.
            Err(ConversionError::InvalidTransition { .. }) => Ok(WorkOutcome::Skipped),
            Err(e) => Err(e),
        }
    }

    /// Spawn the worker loop on the current tokio runtime.
    pub fn spawn(self, receiver: WorkReceiver) -> WorkerHandle {
        let intake = CancellationToken::new();
        let processing = CancellationToken::new();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = tokio::spawn(worker_loop(
            Arc::new(self),
            receiver,
            intake.clone(),
            processing.clone(),
            stats.clone(),
        ));

        WorkerHandle {
            intake,
            processing,
            join,
            stats,
            started: Instant::now(),
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    intake: CancellationToken,
    processing: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerHandle {
    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop taking new work and let in-flight conversions finish.
    pub async fn shutdown(self) -> WorkerStats {
        self.intake.cancel();
        self.wait().await
    }

    /// Stop taking new work and abandon in-flight retries; those records end
    /// up `failed`.
    pub async fn shutdown_now(self) -> WorkerStats {
        self.processing.cancel();
        self.intake.cancel();
        self.wait().await
    }

    /// Wait for the queue to close and drain.
    pub async fn wait(self) -> WorkerStats {
        let WorkerHandle {
            join,
            stats,
            started,
            ..
        } = self;
        if let Err(e) = join.await {
            error!(error = %e, "conversion worker task failed");
        }
        let mut stats = stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = started.elapsed().as_secs();
        stats
    }
}

async fn worker_loop(
    worker: Arc<ConversionWorker>,
    mut receiver: WorkReceiver,
    intake: CancellationToken,
    processing: CancellationToken,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let name = worker.config.name.clone();
    info!(worker = %name, max_concurrent = worker.config.max_concurrent, "conversion worker started");

    let slots = Arc::new(Semaphore::new(worker.config.max_concurrent.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = intake.cancelled() => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let id = tokio::select! {
            biased;
            _ = intake.cancelled() => break,
            next = receiver.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };

        while in_flight.try_join_next().is_some() {}

        if let Ok(mut s) = stats.lock() {
            s.current_running += 1;
        }

        let worker = worker.clone();
        let processing = processing.clone();
        let stats = stats.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let result = worker.execute_one(id, &processing).await;

            if let Ok(mut s) = stats.lock() {
                s.current_running = s.current_running.saturating_sub(1);
                s.processed += 1;
                match result {
                    Ok(WorkOutcome::Succeeded) => s.succeeded += 1,
                    Ok(WorkOutcome::Failed) => s.failed += 1,
                    Ok(WorkOutcome::Skipped) => s.skipped += 1,
                    Err(_) => s.errors += 1,
                }
            }
            if let Err(e) = result {
                error!(worker = %worker.config.name, conversion_id = %id, error = %e, "conversion processing error");
            }
        });
    }

    receiver.close();
    while in_flight.join_next().await.is_some() {}
    info!(worker = %name, "conversion worker stopped");
}
