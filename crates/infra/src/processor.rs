//! Image compositing collaborator.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fitswap_core::{ConversionId, ImageId};

use crate::retry::{Classify, ErrorClass};

/// What the processor needs to composite one conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub conversion_id: ConversionId,
    pub source_image_id: ImageId,
    pub target_image_id: ImageId,
    pub style: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// Known-transient failure (overload, timeout).
    #[error("processor temporarily unavailable: {0}")]
    Transient(String),

    /// The processor refused the input; retrying cannot help.
    #[error("processor rejected input: {0}")]
    Rejected(String),

    /// Opaque failure from an external library; classified by message.
    #[error("{0}")]
    Other(String),
}

impl Classify for ProcessorError {
    fn error_class(&self) -> Option<ErrorClass> {
        match self {
            ProcessorError::Transient(_) => Some(ErrorClass::Retryable),
            ProcessorError::Rejected(_) => Some(ErrorClass::Terminal),
            ProcessorError::Other(_) => None,
        }
    }
}

/// Long-running compositing call. Invoked under the `"processor"` retry policy.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> Result<ImageId, ProcessorError>;
}

/// Test double that replays a script of failures, then succeeds.
#[derive(Debug, Default)]
pub struct ScriptedProcessor {
    script: Mutex<VecDeque<ProcessorError>>,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedProcessor {
    /// Always succeeds.
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// Fails with each error in `failures`, in order, before succeeding.
    pub fn failing_with(failures: impl IntoIterator<Item = ProcessorError>) -> Self {
        Self {
            script: Mutex::new(failures.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Fails with `error` on every call.
    pub fn always_failing(error: ProcessorError, times: usize) -> Self {
        Self::failing_with(std::iter::repeat_n(error, times))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, _request: &ProcessRequest) -> Result<ImageId, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self
            .script
            .lock()
            .map_err(|_| ProcessorError::Other("script lock poisoned".to_string()))?
            .pop_front();
        match next {
            Some(error) => Err(error),
            None => Ok(ImageId::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProcessRequest {
        ProcessRequest {
            conversion_id: ConversionId::new(),
            source_image_id: ImageId::new(),
            target_image_id: ImageId::new(),
            style: None,
        }
    }

    #[tokio::test]
    async fn script_is_replayed_in_order() {
        let processor = ScriptedProcessor::failing_with([
            ProcessorError::Transient("busy".into()),
            ProcessorError::Rejected("bad pose".into()),
        ]);

        assert!(matches!(
            processor.process(&request()).await,
            Err(ProcessorError::Transient(_))
        ));
        assert!(matches!(
            processor.process(&request()).await,
            Err(ProcessorError::Rejected(_))
        ));
        assert!(processor.process(&request()).await.is_ok());
        assert_eq!(processor.calls(), 3);
    }

    #[test]
    fn opaque_errors_defer_to_patterns() {
        assert_eq!(ProcessorError::Other("x".into()).error_class(), None);
        assert_eq!(
            ProcessorError::Rejected("x".into()).error_class(),
            Some(ErrorClass::Terminal)
        );
    }
}
