//! Pending operation table.
//!
//! Keeps the work items of in-flight operations keyed by their correlation
//! key (a delivery tag for sends and dispositions). The table is owned by a
//! single engine task, so it needs no locking: callers reach it only through
//! the engine's command channel.
//!
//! Expiry is driven by a periodic [`PendingTable::sweep`] rather than one
//! timer per item.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::error::LinkError;
use crate::timeout::TimeoutTracker;

/// A work item that can sit in a [`PendingTable`].
pub trait PendingWork {
    /// Deadline bookkeeping of the operation.
    fn tracker(&self) -> &TimeoutTracker;

    /// Most specific failure recorded so far, surfaced instead of a bare
    /// timeout when the item expires.
    fn last_error(&self) -> Option<&LinkError>;

    /// Complete the caller's handle with `error`, consuming the item.
    fn fail(self, error: LinkError);
}

/// Map from correlation key to pending work item.
pub struct PendingTable<K, W> {
    name: &'static str,
    items: HashMap<K, W>,
    inserted_count: u64,
    expired_count: u64,
}

impl<K, W> PendingTable<K, W>
where
    K: Eq + Hash + Clone + fmt::Display,
    W: PendingWork,
{
    /// Create an empty table. `name` shows up in timeout messages.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: HashMap::new(),
            inserted_count: 0,
            expired_count: 0,
        }
    }

    /// Register a work item.
    ///
    /// # Errors
    ///
    /// Hands the item back if the key is already pending.
    pub fn insert(&mut self, key: K, work: W) -> Result<(), W> {
        if self.items.contains_key(&key) {
            return Err(work);
        }
        self.items.insert(key, work);
        self.inserted_count += 1;
        Ok(())
    }

    /// Take the item for `key` out of the table.
    pub fn remove(&mut self, key: &K) -> Option<W> {
        self.items.remove(key)
    }

    /// Borrow the item for `key`.
    pub fn get(&self, key: &K) -> Option<&W> {
        self.items.get(key)
    }

    /// Mutably borrow the item for `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut W> {
        self.items.get_mut(key)
    }

    /// Whether `key` is pending.
    pub fn contains(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keys of every pending item, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        self.items.keys().cloned().collect()
    }

    /// Iterate mutably over every item.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut W)> {
        self.items.iter_mut()
    }

    /// Fail every expired item and return the keys that were removed.
    ///
    /// An item's recorded last error wins over the generic timeout error.
    pub fn sweep(&mut self) -> Vec<K> {
        let expired: Vec<K> = self
            .items
            .iter()
            .filter(|(_, work)| work.tracker().is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(work) = self.items.remove(key) {
                let error = match work.last_error() {
                    Some(error) => error.clone(),
                    None => LinkError::timeout(format!(
                        "{} {} did not complete within {:?}",
                        self.name,
                        key,
                        work.tracker().duration()
                    )),
                };
                tracing::debug!(table = self.name, key = %key, error = %error, "pending operation expired");
                work.fail(error);
                self.expired_count += 1;
            }
        }
        expired
    }

    /// Fail every item with the error built by `make_error`.
    pub fn fail_all(&mut self, mut make_error: impl FnMut(&W) -> LinkError) -> usize {
        let count = self.items.len();
        for (_, work) in self.items.drain() {
            let error = make_error(&work);
            work.fail(error);
        }
        count
    }

    /// Remove and return every item.
    pub fn drain(&mut self) -> Vec<(K, W)> {
        self.items.drain().collect()
    }

    /// Total items ever inserted.
    pub fn inserted_count(&self) -> u64 {
        self.inserted_count
    }

    /// Total items failed by [`sweep`](Self::sweep).
    pub fn expired_count(&self) -> u64 {
        self.expired_count
    }
}

impl<K, W> fmt::Debug for PendingTable<K, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable")
            .field("name", &self.name)
            .field("len", &self.items.len())
            .field("inserted_count", &self.inserted_count)
            .field("expired_count", &self.expired_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::completion::{Completer, Completion, completion};
    use crate::error::ErrorKind;

    struct TestWork {
        tracker: TimeoutTracker,
        last_error: Option<LinkError>,
        completer: Completer<()>,
    }

    impl PendingWork for TestWork {
        fn tracker(&self) -> &TimeoutTracker {
            &self.tracker
        }

        fn last_error(&self) -> Option<&LinkError> {
            self.last_error.as_ref()
        }

        fn fail(self, error: LinkError) {
            let _ = self.completer.complete(Err(error));
        }
    }

    fn work(timeout: Duration) -> (TestWork, Completion<()>) {
        let (completer, completion) = completion();
        (
            TestWork {
                tracker: TimeoutTracker::new(timeout),
                last_error: None,
                completer,
            },
            completion,
        )
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let mut table = PendingTable::new("send");
        let (first, _c1) = work(Duration::from_secs(1));
        let (second, _c2) = work(Duration::from_secs(1));
        assert!(table.insert("a".to_string(), first).is_ok());
        assert!(table.insert("a".to_string(), second).is_err());
        assert_eq!(table.len(), 1);
        assert_eq!(table.inserted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_prefers_last_error() {
        let mut table = PendingTable::new("send");
        let (mut plain, plain_done) = work(Duration::from_secs(1));
        plain.last_error = None;
        let (mut busy, busy_done) = work(Duration::from_secs(1));
        busy.last_error = Some(LinkError::new(ErrorKind::ServerBusy, "throttled"));
        let (slow, _slow_done) = work(Duration::from_secs(10));
        table.insert("plain".to_string(), plain).ok();
        table.insert("busy".to_string(), busy).ok();
        table.insert("slow".to_string(), slow).ok();

        tokio::time::advance(Duration::from_secs(2)).await;
        let mut expired = table.sweep();
        expired.sort();
        assert_eq!(expired, vec!["busy".to_string(), "plain".to_string()]);
        assert!(table.contains(&"slow".to_string()));
        assert_eq!(table.expired_count(), 2);

        assert_eq!(
            plain_done.await.expect_err("expired").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            busy_done.await.expect_err("expired").kind(),
            ErrorKind::ServerBusy
        );
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut table = PendingTable::new("disposition");
        let (a, a_done) = work(Duration::from_secs(1));
        let (b, b_done) = work(Duration::from_secs(1));
        table.insert(1u32.to_string(), a).ok();
        table.insert(2u32.to_string(), b).ok();

        assert_eq!(table.fail_all(|_| LinkError::cancelled("closed")), 2);
        assert!(table.is_empty());
        assert_eq!(a_done.await.expect_err("failed").kind(), ErrorKind::Cancelled);
        assert_eq!(b_done.await.expect_err("failed").kind(), ErrorKind::Cancelled);
    }
}
