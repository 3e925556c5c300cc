//! Retry decisions for link operations.
//!
//! A [`RetryPolicy`] is consulted whenever an operation fails: it answers
//! either `None` (surface the error) or the interval to wait before the next
//! attempt. The decision is a pure function of its inputs plus the explicit
//! per-client attempt counter, so asking twice gives the same answer.
//!
//! # Backoff Strategy
//!
//! [`ExponentialRetry`] grows the interval from `min_backoff` towards
//! `max_backoff`, doubling per consecutive failure and reaching the maximum
//! at `max_retry_count`. When the broker reports [`ErrorKind::ServerBusy`] a
//! fixed floor of [`SERVER_BUSY_BASE_SLEEP`] is added so that every client
//! backs off well clear of an already overloaded broker.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ErrorKind, LinkError};

/// Extra wait added to the backoff when the broker reports it is busy.
pub const SERVER_BUSY_BASE_SLEEP: Duration = Duration::from_secs(10);

/// Decides whether and when a failed operation is retried.
///
/// Implementations are shared by every manager of a client and are called
/// from engine tasks on any runtime worker.
pub trait RetryPolicy: Send + Sync + fmt::Debug + 'static {
    /// Interval to wait before retrying, or `None` to give up.
    ///
    /// Must not mutate the attempt counter.
    fn next_interval(
        &self,
        client_id: &str,
        error: &LinkError,
        remaining: Duration,
    ) -> Option<Duration>;

    /// Record a transient failure for `client_id`.
    fn increment_retry_count(&self, client_id: &str);

    /// Forget earlier failures after a successful operation.
    fn reset_retry_count(&self, client_id: &str);

    /// Consecutive failures recorded for `client_id`.
    fn retry_count(&self, client_id: &str) -> u32;
}

/// Per-client consecutive failure counters.
#[derive(Debug, Default)]
pub struct RetryCounters {
    counts: Mutex<HashMap<String, u32>>,
}

impl RetryCounters {
    /// Create an empty counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `client_id`.
    pub fn get(&self, client_id: &str) -> u32 {
        self.counts.lock().get(client_id).copied().unwrap_or(0)
    }

    /// Add one failure for `client_id`.
    pub fn increment(&self, client_id: &str) {
        let mut counts = self.counts.lock();
        let count = counts.entry(client_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Reset `client_id` to zero.
    pub fn reset(&self, client_id: &str) {
        self.counts.lock().remove(client_id);
    }
}

/// Exponential backoff with a server-busy floor.
#[derive(Debug)]
pub struct ExponentialRetry {
    min_backoff: Duration,
    max_backoff: Duration,
    max_retry_count: u32,
    counters: RetryCounters,
}

impl Default for ExponentialRetry {
    fn default() -> Self {
        Self::new(Duration::ZERO, Duration::from_secs(30), 10)
    }
}

impl ExponentialRetry {
    /// Create a policy backing off between the two bounds.
    pub fn new(min_backoff: Duration, max_backoff: Duration, max_retry_count: u32) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            max_retry_count,
            counters: RetryCounters::new(),
        }
    }

    /// Lower bound of the backoff.
    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    /// Upper bound of the backoff (before the server-busy floor).
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Attempts after which the policy gives up.
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Backoff for the given number of consecutive failures.
    ///
    /// The span between the bounds is halved once per attempt still left
    /// before `max_retry_count`.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let span = self.max_backoff - self.min_backoff;
        let halvings = self.max_retry_count.saturating_sub(attempt).min(31);
        self.min_backoff + span / (1u32 << halvings)
    }
}

impl RetryPolicy for ExponentialRetry {
    fn next_interval(
        &self,
        client_id: &str,
        error: &LinkError,
        remaining: Duration,
    ) -> Option<Duration> {
        if !error.is_transient() {
            return None;
        }

        let attempt = self.counters.get(client_id);
        if attempt >= self.max_retry_count {
            return None;
        }

        let mut interval = self.backoff_for_attempt(attempt);
        if error.kind() == ErrorKind::ServerBusy {
            interval += SERVER_BUSY_BASE_SLEEP;
        }

        if interval > remaining {
            return None;
        }
        Some(interval)
    }

    fn increment_retry_count(&self, client_id: &str) {
        self.counters.increment(client_id);
    }

    fn reset_retry_count(&self, client_id: &str) {
        self.counters.reset(client_id);
    }

    fn retry_count(&self, client_id: &str) -> u32 {
        self.counters.get(client_id)
    }
}

/// Policy that never retries. Failures are still counted.
#[derive(Debug, Default)]
pub struct NoRetry {
    counters: RetryCounters,
}

impl NoRetry {
    /// Create the policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetryPolicy for NoRetry {
    fn next_interval(&self, _: &str, _: &LinkError, _: Duration) -> Option<Duration> {
        None
    }

    fn increment_retry_count(&self, client_id: &str) {
        self.counters.increment(client_id);
    }

    fn reset_retry_count(&self, client_id: &str) {
        self.counters.reset(client_id);
    }

    fn retry_count(&self, client_id: &str) -> u32 {
        self.counters.get(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: &str = "sender-1";

    fn transient() -> LinkError {
        LinkError::new(ErrorKind::Communication, "connection reset")
    }

    #[test]
    fn test_non_transient_is_never_retried() {
        let policy = ExponentialRetry::default();
        let err = LinkError::new(ErrorKind::EntityNotFound, "no such queue");
        assert_eq!(
            policy.next_interval(CLIENT, &err, Duration::from_secs(3600)),
            None
        );
    }

    #[test]
    fn test_same_inputs_same_answer() {
        let policy = ExponentialRetry::default();
        policy.increment_retry_count(CLIENT);
        policy.increment_retry_count(CLIENT);

        let first = policy.next_interval(CLIENT, &transient(), Duration::from_secs(60));
        let second = policy.next_interval(CLIENT, &transient(), Duration::from_secs(60));
        assert_eq!(first, second);
        assert!(first.is_some());
        assert_eq!(policy.retry_count(CLIENT), 2);
    }

    #[test]
    fn test_backoff_grows_towards_max() {
        let policy = ExponentialRetry::new(Duration::from_millis(100), Duration::from_secs(10), 5);
        let mut previous = Duration::ZERO;
        for _ in 0..5 {
            let interval = policy
                .next_interval(CLIENT, &transient(), Duration::from_secs(60))
                .expect("within budget");
            assert!(interval >= previous);
            assert!(interval >= Duration::from_millis(100));
            assert!(interval <= Duration::from_secs(10));
            previous = interval;
            policy.increment_retry_count(CLIENT);
        }
        // Counter reached max_retry_count.
        assert_eq!(
            policy.next_interval(CLIENT, &transient(), Duration::from_secs(60)),
            None
        );

        policy.reset_retry_count(CLIENT);
        assert_eq!(policy.retry_count(CLIENT), 0);
        assert!(policy
            .next_interval(CLIENT, &transient(), Duration::from_secs(60))
            .is_some());
    }

    #[test]
    fn test_server_busy_adds_floor() {
        let policy = ExponentialRetry::default();
        let busy = LinkError::new(ErrorKind::ServerBusy, "throttled");
        let plain = policy
            .next_interval(CLIENT, &transient(), Duration::from_secs(60))
            .expect("plain retry");
        let throttled = policy
            .next_interval(CLIENT, &busy, Duration::from_secs(60))
            .expect("busy retry");
        assert_eq!(throttled, plain + SERVER_BUSY_BASE_SLEEP);
    }

    #[test]
    fn test_interval_beyond_budget_gives_up() {
        let policy = ExponentialRetry::default();
        let busy = LinkError::new(ErrorKind::ServerBusy, "throttled");
        assert_eq!(
            policy.next_interval(CLIENT, &busy, Duration::from_secs(5)),
            None
        );
    }

    #[test]
    fn test_counters_are_per_client() {
        let policy = ExponentialRetry::default();
        policy.increment_retry_count("a");
        policy.increment_retry_count("a");
        policy.increment_retry_count("b");
        assert_eq!(policy.retry_count("a"), 2);
        assert_eq!(policy.retry_count("b"), 1);
        policy.reset_retry_count("a");
        assert_eq!(policy.retry_count("a"), 0);
        assert_eq!(policy.retry_count("b"), 1);
    }

    #[test]
    fn test_no_retry() {
        let policy = NoRetry::new();
        assert_eq!(
            policy.next_interval(CLIENT, &transient(), Duration::from_secs(60)),
            None
        );
        policy.increment_retry_count(CLIENT);
        assert_eq!(policy.retry_count(CLIENT), 1);
    }
}
