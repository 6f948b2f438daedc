//! Retry executor: runs an async operation under a named policy.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::policy::{Classify, ErrorClass, RetryPolicies, RetryPolicy};

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The error was classified terminal; no further attempts were made.
    #[error("non-retryable error after {attempts} attempt(s): {source}")]
    NonRetryable { attempts: u32, source: E },

    /// Every attempt allowed by the policy failed.
    #[error("exhausted retries after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: E },

    /// Cancellation fired before or between attempts.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last underlying error, if any attempt ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { last, .. } => last,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Runs fallible async operations with backoff, per operation class.
///
/// Cheap to clone; policies are shared.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policies: Arc<RetryPolicies>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicies::default())
    }
}

impl RetryExecutor {
    pub fn new(policies: RetryPolicies) -> Self {
        Self {
            policies: Arc::new(policies),
        }
    }

    pub fn policy(&self, key: &str) -> &RetryPolicy {
        self.policies.get(key)
    }

    /// Run `operation` under the policy registered for `policy_key`.
    ///
    /// `operation` receives the 0-indexed attempt number. Terminal errors
    /// return immediately; retryable ones wait out the backoff unless
    /// `cancel` fires first.
    pub async fn execute<T, E, F, Fut>(
        &self,
        policy_key: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policies.get(policy_key);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last: None,
                });
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(policy = policy_key, attempts = attempt + 1, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let attempts = attempt + 1;
            if policy.classify(&error) == ErrorClass::Terminal {
                warn!(policy = policy_key, attempts, error = %error, "non-retryable error");
                return Err(RetryError::NonRetryable {
                    attempts,
                    source: error,
                });
            }

            if !policy.should_retry(attempts) {
                warn!(policy = policy_key, attempts, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts,
                    source: error,
                });
            }

            let delay = policy.backoff(attempt);
            debug!(
                policy = policy_key,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts,
                        last: Some(error),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt = attempts;
        }
    }
}
