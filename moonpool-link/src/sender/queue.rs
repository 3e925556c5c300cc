//! Transmission order of pending sends.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::message::DeliveryTag;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    retry: bool,
    seq: u64,
    tag: DeliveryTag,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: retries first, then the oldest entry.
        self.retry
            .cmp(&other.retry)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delivery tags waiting for link credit.
///
/// Retried deliveries are served before fresh ones so that a backlog of new
/// sends cannot starve them; each class is FIFO. The queue only holds tags:
/// the work itself lives in the pending table, and tags whose work already
/// completed are skipped by the caller.
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue a first attempt.
    pub(crate) fn push(&mut self, tag: DeliveryTag) {
        self.push_entry(tag, false);
    }

    /// Enqueue a retried delivery.
    pub(crate) fn push_retry(&mut self, tag: DeliveryTag) {
        self.push_entry(tag, true);
    }

    fn push_entry(&mut self, tag: DeliveryTag, retry: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { retry, seq, tag });
    }

    /// Next tag to transmit.
    pub(crate) fn pop(&mut self) -> Option<DeliveryTag> {
        self.heap.pop().map(|entry| entry.tag)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
