//! Hands admitted conversions to the worker queue.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fitswap_core::ConversionId;
use fitswap_infra::{RetryExecutor, WorkQueue};

const QUEUE_POLICY: &str = "queue";

/// Fire-and-forget enqueue.
///
/// A failed dispatch is logged and dropped. The record already exists, so
/// the caller's result does not change.
pub struct JobDispatcher {
    queue: Arc<dyn WorkQueue>,
    retry: RetryExecutor,
}

impl JobDispatcher {
    pub fn new(queue: Arc<dyn WorkQueue>, retry: RetryExecutor) -> Self {
        Self { queue, retry }
    }

    pub async fn dispatch(&self, id: ConversionId) {
        let cancel = CancellationToken::new();
        match self
            .retry
            .execute(QUEUE_POLICY, &cancel, |_| self.queue.enqueue(id))
            .await
        {
            Ok(()) => debug!(conversion_id = %id, "conversion dispatched"),
            Err(e) => warn!(
                conversion_id = %id,
                attempts = e.attempts(),
                error = %e,
                "dispatch failed; conversion stays pending"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fitswap_infra::{InMemoryWorkQueue, RetryPolicies, RetryPolicy};

    fn executor() -> RetryExecutor {
        RetryExecutor::new(RetryPolicies::new(RetryPolicy::no_retry()).with_policy(
            "queue",
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        ))
    }

    #[tokio::test]
    async fn dispatch_enqueues_the_id() {
        let (queue, mut rx) = InMemoryWorkQueue::bounded(4);
        let dispatcher = JobDispatcher::new(Arc::new(queue), executor());
        let id = ConversionId::new();

        dispatcher.dispatch(id).await;
        assert_eq!(rx.try_recv(), Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_is_swallowed() {
        let (queue, mut rx) = InMemoryWorkQueue::bounded(4);
        rx.close();
        let dispatcher = JobDispatcher::new(Arc::new(queue), executor());

        dispatcher.dispatch(ConversionId::new()).await;
        assert_eq!(rx.try_recv(), None);
    }
}
