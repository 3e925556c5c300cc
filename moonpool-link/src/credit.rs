//! Receiver credit flow control.
//!
//! The arithmetic lives in [`compute_credit`], a pure function over a
//! [`CreditSnapshot`]. [`CreditFlowController`] wraps it with the little
//! state a receiver engine needs between calls: credit granted to the
//! broker but not yet consumed, and credit computed but not yet sent.
//!
//! # Batching
//!
//! Granting one credit per consumed message floods the wire with tiny flow
//! frames. Computed credit therefore accumulates and is only sent when:
//! - the link was just opened (initial grant),
//! - the accumulated amount reaches the prefetch count, or
//! - the accumulated amount reaches the batch threshold.
//!
//! The receiver's dispatch tick also calls [`CreditFlowController::flush`],
//! so small top-ups are delayed by at most one dispatch interval.
//!
//! # Reclaiming
//!
//! Credit is granted for demand that may go away: a receive call that
//! expires leaves its credit with the broker. When outstanding credit plus
//! buffered messages exceed `prefetch + demand + batch_threshold`,
//! [`CreditFlowController::reclaim`] asks the engine to drain the link and
//! starts over from zero outstanding credit.

/// Inputs to a credit computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditSnapshot {
    /// Credit the broker may still use.
    pub outstanding_credit: u32,
    /// Messages in the prefetch buffer.
    pub buffered: u32,
    /// Messages requested by pending receive calls and not yet handed out.
    pub demand: u32,
    /// Configured prefetch count.
    pub prefetch: u32,
    /// Credit computed earlier and not sent yet.
    pub unsent: u32,
    /// Batch threshold.
    pub batch_threshold: u32,
    /// No credit was granted on this link yet.
    pub fresh_link: bool,
}

/// Output of a credit computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditDecision {
    /// Additional credit needed on top of what is outstanding and unsent.
    pub needed: u32,
    /// Whether the accumulated credit (`unsent + needed`) should be sent now.
    pub send_now: bool,
}

/// Compute how much additional credit to request.
///
/// `needed = demand + prefetch - (outstanding + buffered + unsent)`,
/// saturating at zero.
pub fn compute_credit(snapshot: CreditSnapshot) -> CreditDecision {
    let target = snapshot.demand.saturating_add(snapshot.prefetch);
    let covered = snapshot
        .outstanding_credit
        .saturating_add(snapshot.buffered)
        .saturating_add(snapshot.unsent);
    let needed = target.saturating_sub(covered);
    let accumulated = snapshot.unsent.saturating_add(needed);

    let send_now = accumulated > 0
        && (snapshot.fresh_link
            || accumulated >= snapshot.prefetch
            || accumulated >= snapshot.batch_threshold);

    CreditDecision { needed, send_now }
}

/// Per-link credit bookkeeping of a receiver engine.
#[derive(Debug, Clone)]
pub struct CreditFlowController {
    prefetch: u32,
    batch_threshold: u32,
    outstanding: u32,
    unsent: u32,
    fresh_link: bool,
}

impl CreditFlowController {
    /// Create a controller for a fresh link.
    pub fn new(prefetch: u32, batch_threshold: u32) -> Self {
        Self {
            prefetch,
            batch_threshold: batch_threshold.max(1),
            outstanding: 0,
            unsent: 0,
            fresh_link: true,
        }
    }

    /// Forget everything granted to the previous link instance.
    pub fn reset(&mut self) {
        self.outstanding = 0;
        self.unsent = 0;
        self.fresh_link = true;
    }

    /// Credit the broker may still use.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Credit computed but not sent.
    pub fn unsent(&self) -> u32 {
        self.unsent
    }

    /// Configured prefetch count.
    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    /// Account for one delivery consuming one credit.
    pub fn on_delivery(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Recompute credit. Returns the amount to grant now, if any.
    pub fn evaluate(&mut self, buffered: u32, demand: u32) -> Option<u32> {
        let decision = compute_credit(CreditSnapshot {
            outstanding_credit: self.outstanding,
            buffered,
            demand,
            prefetch: self.prefetch,
            unsent: self.unsent,
            batch_threshold: self.batch_threshold,
            fresh_link: self.fresh_link,
        });
        self.unsent = self.unsent.saturating_add(decision.needed);
        if decision.send_now {
            self.take_unsent()
        } else {
            None
        }
    }

    /// Grant whatever credit accumulated, regardless of thresholds.
    pub fn flush(&mut self) -> Option<u32> {
        self.take_unsent()
    }

    /// Take back credit that no longer serves any demand.
    ///
    /// Returns `true` when the link must be drained: outstanding credit is
    /// then considered gone and the next [`evaluate`](Self::evaluate)
    /// grants afresh. Unsent credit is trimmed to what is still needed.
    pub fn reclaim(&mut self, buffered: u32, demand: u32) -> bool {
        let target = demand.saturating_add(self.prefetch);
        let covered = self.outstanding.saturating_add(buffered);
        self.unsent = self.unsent.min(target.saturating_sub(covered));

        if covered <= target.saturating_add(self.batch_threshold) {
            return false;
        }
        self.outstanding = 0;
        self.unsent = 0;
        self.fresh_link = true;
        true
    }

    fn take_unsent(&mut self) -> Option<u32> {
        if self.unsent == 0 {
            return None;
        }
        let grant = std::mem::take(&mut self.unsent);
        self.outstanding = self.outstanding.saturating_add(grant);
        self.fresh_link = false;
        Some(grant)
    }
}
