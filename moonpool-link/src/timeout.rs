//! Deadline bookkeeping for pending operations.

use std::time::Duration;

use tokio::time::Instant;

/// Immutable deadline computed once when an operation is created.
///
/// Uses tokio's clock so paused-time tests drive expiry deterministically.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTracker {
    started_at: Instant,
    duration: Duration,
}

impl TimeoutTracker {
    /// Start tracking `duration` from now.
    pub fn new(duration: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            duration,
        }
    }

    /// The original budget.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time spent since creation.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Budget left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.elapsed())
    }

    /// Whether the budget is exhausted.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The instant at which the budget runs out.
    pub fn deadline(&self) -> Instant {
        self.started_at + self.duration
    }
}
