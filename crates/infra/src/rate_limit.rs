//! Short-window request-frequency gate, independent of quota.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fitswap_core::UserId;

use crate::config::RateLimitConfig;

/// The caller has used up its window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limit of {limit} requests per {}s exceeded; retry in {}ms", window.as_secs(), retry_after.as_millis())]
pub struct RateLimited {
    pub retry_after: Duration,
    pub limit: u32,
    pub window: Duration,
}

/// `check` is a pure gate; `record` counts an admitted request.
pub trait RateLimiter: Send + Sync {
    fn check(&self, user_id: UserId) -> Result<(), RateLimited>;
    fn record(&self, user_id: UserId);
    fn reset(&self, user_id: UserId);
}

/// Sliding-window log: one timestamp per recorded request.
///
/// A user's entry is dropped once its window empties, either when the user
/// is next checked or by [`SlidingWindowRateLimiter::purge_idle`].
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    max_requests: u32,
    window: Duration,
    hits: Mutex<HashMap<UserId, VecDeque<Instant>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            log.pop_front();
        }
    }

    /// Drop every user whose window has emptied. Returns how many were removed.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let Ok(mut hits) = self.hits.lock() else {
            warn!("rate limiter lock poisoned; skipping purge");
            return 0;
        };
        let before = hits.len();
        hits.retain(|_, log| {
            Self::prune(log, now, self.window);
            !log.is_empty()
        });
        before - hits.len()
    }

    /// Users currently holding window state.
    pub fn tracked_users(&self) -> usize {
        self.hits.lock().map(|hits| hits.len()).unwrap_or(0)
    }

    /// Run [`purge_idle`](Self::purge_idle) every `every` until `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("rate limiter cleanup stopped");
                        break;
                    }
                    _ = tokio::time::sleep(every) => {
                        let removed = limiter.purge_idle();
                        if removed > 0 {
                            debug!(removed, remaining = limiter.tracked_users(), "idle rate limit entries purged");
                        }
                    }
                }
            }
        })
    }

    fn limited(&self, retry_after: Duration) -> RateLimited {
        RateLimited {
            retry_after,
            limit: self.max_requests,
            window: self.window,
        }
    }
}

impl RateLimiter for SlidingWindowRateLimiter {
    fn check(&self, user_id: UserId) -> Result<(), RateLimited> {
        if self.max_requests == 0 {
            return Err(self.limited(self.window));
        }

        let now = Instant::now();
        let mut hits = match self.hits.lock() {
            Ok(hits) => hits,
            Err(_) => {
                warn!(user_id = %user_id, "rate limiter lock poisoned; allowing request");
                return Ok(());
            }
        };
        let Some(log) = hits.get_mut(&user_id) else {
            return Ok(());
        };
        Self::prune(log, now, self.window);

        if log.is_empty() {
            hits.remove(&user_id);
            return Ok(());
        }
        if log.len() < self.max_requests as usize {
            return Ok(());
        }
        let retry_after = log
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        Err(self.limited(retry_after))
    }

    fn record(&self, user_id: UserId) {
        let now = Instant::now();
        match self.hits.lock() {
            Ok(mut hits) => {
                let log = hits.entry(user_id).or_default();
                Self::prune(log, now, self.window);
                log.push_back(now);
            }
            Err(_) => warn!(user_id = %user_id, "rate limiter lock poisoned; request not recorded"),
        }
    }

    fn reset(&self, user_id: UserId) {
        if let Ok(mut hits) = self.hits.lock() {
            hits.remove(&user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_refills_as_the_window_slides() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        let user = UserId::new();

        limiter.check(user).unwrap();
        limiter.record(user);
        tokio::time::advance(Duration::from_secs(20)).await;
        limiter.check(user).unwrap();
        limiter.record(user);

        let err = limiter.check(user).unwrap_err();
        assert_eq!(err.limit, 2);
        assert_eq!(err.retry_after, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.check(user).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn check_alone_does_not_consume() {
        let limiter = SlidingWindowRateLimiter::new(1, Duration::from_secs(1));
        let user = UserId::new();
        for _ in 0..5 {
            assert!(limiter.check(user).is_ok());
        }
        limiter.record(user);
        assert!(limiter.check(user).is_err());
        assert!(limiter.check(UserId::new()).is_ok());

        limiter.reset(user);
        assert!(limiter.check(user).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_windows_release_their_entries() {
        let limiter = SlidingWindowRateLimiter::new(5, Duration::from_secs(60));
        let users: Vec<_> = (0..1_000).map(|_| UserId::new()).collect();
        for user in &users {
            limiter.record(*user);
        }
        assert_eq!(limiter.tracked_users(), 1_000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        limiter.record(UserId::new());
        limiter.check(users[0]).unwrap();
        assert_eq!(limiter.tracked_users(), 1_000);

        assert_eq!(limiter.purge_idle(), 999);
        assert_eq!(limiter.tracked_users(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_purges_until_cancelled() {
        let limiter = Arc::new(SlidingWindowRateLimiter::new(5, Duration::from_secs(10)));
        for _ in 0..50 {
            limiter.record(UserId::new());
        }
        let cancel = CancellationToken::new();
        let task = limiter.spawn_cleanup(Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(limiter.tracked_users(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn zero_budget_always_limits() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(5));
        let err = limiter.check(UserId::new()).unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(5));
    }
}
