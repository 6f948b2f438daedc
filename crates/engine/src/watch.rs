//! Long-poll wait for a conversion to reach a terminal state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fitswap_conversions::ConversionRecord;
use fitswap_core::{ConversionId, UserId};
use fitswap_infra::{ConversionStore, StoreError, WatchConfig};

use crate::error::{ConversionError, ConversionResult};

/// Floor for the poll interval; a zero period cannot drive a ticker.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bounded watch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WatchOptions {
    /// Clamp caller-supplied values into the configured bounds; missing
    /// values take the configured defaults. Inverted poll bounds resolve to
    /// the floor.
    pub fn clamped(
        timeout: Option<Duration>,
        poll_interval: Option<Duration>,
        config: &WatchConfig,
    ) -> Self {
        let timeout = timeout
            .unwrap_or_else(|| config.default_timeout())
            .min(config.max_timeout());
        let poll_interval = poll_interval
            .unwrap_or_else(|| config.default_poll())
            .min(config.max_poll())
            .max(config.min_poll())
            .max(MIN_POLL_INTERVAL);
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Blocks the calling task (and only that task) until the record is
/// terminal or the deadline passes.
///
/// Always returns a record once ownership is established: on deadline or
/// cancellation it makes one last read bounded by the grace period, and
/// falls back to the last snapshot it saw.
pub struct WatchEngine {
    store: Arc<dyn ConversionStore>,
    grace: Duration,
}

impl WatchEngine {
    pub fn new(store: Arc<dyn ConversionStore>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub async fn watch(
        &self,
        id: ConversionId,
        user_id: UserId,
        options: WatchOptions,
        cancel: &CancellationToken,
    ) -> ConversionResult<ConversionRecord> {
        let started = Instant::now();
        let deadline = started + options.timeout;

        let initial = tokio::select! {
            biased;
            read = self.store.get_conversion(id) => read?,
            _ = cancel.cancelled() => return Err(ConversionError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(ConversionError::Cancelled),
        };
        if !initial.is_owned_by(user_id) {
            return Err(ConversionError::NotFound(id));
        }
        if initial.is_terminal() {
            return Ok(initial);
        }

        let poll_interval = options.poll_interval.max(MIN_POLL_INTERVAL);
        let mut ticker = tokio::time::interval_at(started + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = initial;

        loop {
            // Immediate check first, then wait for the next tick.
            let read = tokio::select! {
                biased;
                read = self.store.get_conversion(id) => Some(read),
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match read {
                None => break,
                Some(Ok(record)) if record.is_terminal() => {
                    debug!(
                        conversion_id = %id,
                        status = %record.status,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "watch observed terminal state"
                    );
                    return Ok(record);
                }
                Some(Ok(record)) => last = record,
                Some(Err(StoreError::NotFound(_))) => return Err(ConversionError::NotFound(id)),
                Some(Err(e)) => {
                    warn!(conversion_id = %id, error = %e, "watch poll failed; keeping last snapshot")
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {}
            }
        }

        debug!(
            conversion_id = %id,
            cancelled = cancel.is_cancelled(),
            waited_ms = started.elapsed().as_millis() as u64,
            "watch ended without terminal state"
        );
        match tokio::time::timeout(self.grace, self.store.get_conversion(id)).await {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(e)) => {
                debug!(conversion_id = %id, error = %e, "final watch read failed; returning last snapshot");
                Ok(last)
            }
            Err(_) => {
                debug!(conversion_id = %id, "final watch read timed out; returning last snapshot");
                Ok(last)
            }
        }
    }
}
