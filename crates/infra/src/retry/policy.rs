//! Retry policies and error classification.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fraction of the computed delay that jitter may add on top.
const JITTER_FRACTION: f64 = 0.1;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * (attempt + 1)
    Linear,
}

/// Retry decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Errors that know whether retrying them can help.
///
/// Errors raised by our own collaborators tag themselves; returning `None`
/// defers to the policy's substring patterns, which exist for errors that
/// arrive from opaque external libraries.
pub trait Classify: std::error::Error {
    fn error_class(&self) -> Option<ErrorClass> {
        None
    }
}

/// Retry policy for one operation class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between retries
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay cap
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Add up to 10% random delay on top of the computed one.
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Error substrings that are worth retrying.
    #[serde(default)]
    pub retryable_patterns: Vec<String>,
    /// Error substrings that abort immediately. Checked first.
    #[serde(default)]
    pub non_retryable_patterns: Vec<String>,
    /// Retry a message that matches neither list. When false, only
    /// `retryable_patterns` hits are retried.
    #[serde(default = "default_true")]
    pub retry_unmatched: bool,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: true,
            retryable_patterns: [
                "timeout",
                "timed out",
                "temporarily",
                "connection",
                "unavailable",
                "429",
                "503",
            ]
            .map(String::from)
            .to_vec(),
            non_retryable_patterns: [
                "invalid",
                "not found",
                "unauthorized",
                "forbidden",
                "unsupported",
            ]
            .map(String::from)
            .to_vec(),
            retry_unmatched: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: false,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_patterns(
        mut self,
        retryable: impl IntoIterator<Item = impl Into<String>>,
        non_retryable: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.retryable_patterns = retryable.into_iter().map(Into::into).collect();
        self.non_retryable_patterns = non_retryable.into_iter().map(Into::into).collect();
        self
    }

    /// Reject configurations the executor cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay_ms must not be smaller than base_delay_ms".to_string());
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err("multiplier must be a finite number >= 1.0".to_string());
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (0-indexed), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                base_ms * exp
            }
            BackoffStrategy::Linear => base_ms * (f64::from(attempt) + 1.0),
        };

        Duration::from_millis(delay_ms.min(max_ms).max(0.0) as u64)
    }

    /// Delay including jitter, still capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread_ms = (delay.as_millis() as f64 * JITTER_FRACTION) as u64;
        let extra = if spread_ms > 0 {
            rand::thread_rng().gen_range(0..=spread_ms)
        } else {
            0
        };
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Classify an error message against the pattern lists.
    ///
    /// Non-retryable patterns win ties; a message matching neither list is
    /// retried only when `retry_unmatched` is set.
    pub fn classify_message(&self, message: &str) -> ErrorClass {
        let message = message.to_lowercase();
        let hit = |patterns: &[String]| {
            patterns
                .iter()
                .any(|p| !p.is_empty() && message.contains(&p.to_lowercase()))
        };

        if hit(&self.non_retryable_patterns) {
            ErrorClass::Terminal
        } else if self.retry_unmatched || hit(&self.retryable_patterns) {
            ErrorClass::Retryable
        } else {
            ErrorClass::Terminal
        }
    }

    /// Classify an error: its own tag first, then the substring shim.
    pub fn classify<E: Classify + ?Sized>(&self, error: &E) -> ErrorClass {
        error
            .error_class()
            .unwrap_or_else(|| self.classify_message(&error.to_string()))
    }
}

/// Policies keyed by operation class, falling back to `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicies {
    #[serde(default)]
    pub default: RetryPolicy,
    #[serde(default)]
    pub policies: HashMap<String, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "processor".to_string(),
            RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(30)),
        );
        policies.insert(
            "notifier".to_string(),
            RetryPolicy::fixed(3, Duration::from_millis(500)),
        );
        policies.insert(
            "images".to_string(),
            RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(2)),
        );
        policies.insert(
            "queue".to_string(),
            RetryPolicy::exponential(3, Duration::from_millis(50), Duration::from_secs(1)),
        );
        Self {
            default: RetryPolicy::default(),
            policies,
        }
    }
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, key: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(key.into(), policy);
        self
    }

    /// Look up the policy for an operation class.
    pub fn get(&self, key: &str) -> &RetryPolicy {
        self.policies.get(key).unwrap_or(&self.default)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.default
            .validate()
            .map_err(|e| format!("retry.default: {e}"))?;
        for (key, policy) in &self.policies {
            policy
                .validate()
                .map_err(|e| format!("retry.policies.{key}: {e}"))?;
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
