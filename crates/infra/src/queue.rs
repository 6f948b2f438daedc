//! Worker queue collaborator.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use fitswap_core::ConversionId;

use crate::retry::{Classify, ErrorClass};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,

    #[error("work queue is closed")]
    Closed,
}

impl Classify for QueueError {
    fn error_class(&self) -> Option<ErrorClass> {
        Some(match self {
            QueueError::Full => ErrorClass::Retryable,
            QueueError::Closed => ErrorClass::Terminal,
        })
    }
}

/// Hands conversion ids to the asynchronous worker.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, id: ConversionId) -> Result<(), QueueError>;
}

/// Bounded in-process queue over a tokio channel.
#[derive(Debug, Clone)]
pub struct InMemoryWorkQueue {
    tx: mpsc::Sender<ConversionId>,
}

/// Consumer side of an [`InMemoryWorkQueue`].
#[derive(Debug)]
pub struct WorkReceiver {
    rx: mpsc::Receiver<ConversionId>,
}

impl InMemoryWorkQueue {
    pub fn bounded(capacity: usize) -> (Self, WorkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, WorkReceiver { rx })
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, id: ConversionId) -> Result<(), QueueError> {
        self.tx.try_send(id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

impl WorkReceiver {
    /// Next queued id, or `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<ConversionId> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConversionId> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}
