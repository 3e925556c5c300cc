//! Shared, lazily attached management link.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use super::{ManagementRequest, ManagementResponse, RequestResponseLink};
use crate::completion::{Completion, completion};
use crate::error::{LinkError, LinkResult};
use crate::message::TransactionId;
use crate::protocol::LinkFactory;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::timeout::TimeoutTracker;

/// The `$management` link of one entity, shared by every manager of that
/// entity.
///
/// The link is attached on first use. Concurrent first requests wait on the
/// same attach. Managers [`retain`](Self::retain) the channel while they
/// run; the last [`release`](Self::release) detaches the link.
#[derive(Clone)]
pub struct ManagementChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    entity_path: String,
    client_id: String,
    factory: Arc<dyn LinkFactory>,
    retry: Arc<dyn RetryPolicy>,
    link: Mutex<Option<Arc<dyn RequestResponseLink>>>,
    users: AtomicUsize,
}

impl ManagementChannel {
    /// Channel for `entity_path`. Nothing is attached until the first request.
    pub fn new(
        entity_path: impl Into<String>,
        client_id: impl Into<String>,
        factory: Arc<dyn LinkFactory>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                entity_path: entity_path.into(),
                client_id: client_id.into(),
                factory,
                retry,
                link: Mutex::new(None),
                users: AtomicUsize::new(0),
            }),
        }
    }

    /// Entity the channel manages.
    pub fn entity_path(&self) -> &str {
        &self.inner.entity_path
    }

    /// Register a manager using the channel.
    pub fn retain(&self) {
        self.inner.users.fetch_add(1, Ordering::AcqRel);
    }

    /// Unregister a manager. The last one detaches the link.
    pub async fn release(&self) {
        let previous = self
            .inner
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous != Ok(1) {
            return;
        }
        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            tracing::debug!(entity_path = %self.inner.entity_path, "closing management link");
            link.close().await;
        }
    }

    /// Number of managers using the channel.
    pub fn user_count(&self) -> usize {
        self.inner.users.load(Ordering::Acquire)
    }

    /// Whether a management link is currently attached.
    pub async fn is_attached(&self) -> bool {
        self.inner.link.lock().await.is_some()
    }

    /// Send `request`, retrying transient failures within `timeout`.
    ///
    /// A transient failure drops the cached link so the next attempt
    /// attaches a fresh one.
    pub async fn request(
        &self,
        request: ManagementRequest,
        transaction: Option<TransactionId>,
        timeout: Duration,
    ) -> LinkResult<ManagementResponse> {
        let tracker = TimeoutTracker::new(timeout);
        let retry = &self.inner.retry;
        let client_id = &self.inner.client_id;

        loop {
            let attempt = self.attempt(&request, transaction.clone(), &tracker).await;
            let error = match attempt {
                Ok(response) => {
                    retry.reset_retry_count(client_id);
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(error);
            }
            retry.increment_retry_count(client_id);
            match retry.next_interval(client_id, &error, tracker.remaining()) {
                Some(interval) => {
                    tracing::warn!(
                        operation = request.operation(),
                        entity_path = %self.inner.entity_path,
                        error = %error,
                        ?interval,
                        "management request failed, retrying"
                    );
                    tokio::time::sleep(interval).await;
                }
                None => return Err(error),
            }
        }
    }

    /// Run [`request`](Self::request) on a scheduler task and convert the
    /// response with `map`.
    pub(crate) fn call<T, F>(
        &self,
        scheduler: &Scheduler,
        request: ManagementRequest,
        transaction: Option<TransactionId>,
        timeout: Duration,
        map: F,
    ) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(ManagementResponse) -> LinkResult<T> + Send + 'static,
    {
        let (completer, completion) = completion();
        let channel = self.clone();
        let name = format!("management:{}", request.operation());
        scheduler.spawn_task(&name, async move {
            let result = channel
                .request(request, transaction, timeout)
                .await
                .and_then(map);
            let _ = completer.complete(result);
        });
        completion
    }

    async fn attempt(
        &self,
        request: &ManagementRequest,
        transaction: Option<TransactionId>,
        tracker: &TimeoutTracker,
    ) -> LinkResult<ManagementResponse> {
        let link = self.link(tracker).await?;
        let remaining = tracker.remaining();
        let result = tokio::time::timeout(
            remaining,
            link.request(request.clone(), transaction, remaining),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LinkError::timeout(format!(
                "{} did not complete within {:?}",
                request.operation(),
                tracker.duration()
            )))
        });

        if let Err(error) = &result {
            if error.is_transient() {
                self.invalidate(&link).await;
            }
        }
        result
    }

    async fn link(&self, tracker: &TimeoutTracker) -> LinkResult<Arc<dyn RequestResponseLink>> {
        let mut slot = self.inner.link.lock().await;
        if let Some(link) = slot.as_ref() {
            return Ok(link.clone());
        }

        tracing::debug!(entity_path = %self.inner.entity_path, "attaching management link");
        let link = tokio::time::timeout(
            tracker.remaining(),
            self.inner
                .factory
                .create_request_response(&self.inner.entity_path),
        )
        .await
        .unwrap_or_else(|_| Err(LinkError::timeout("management link attach timed out")))?;
        *slot = Some(link.clone());
        Ok(link)
    }

    async fn invalidate(&self, failed: &Arc<dyn RequestResponseLink>) {
        let mut slot = self.inner.link.lock().await;
        let is_current = slot
            .as_ref()
            .map(|current| Arc::ptr_eq(current, failed))
            .unwrap_or(false);
        if is_current {
            tracing::debug!(entity_path = %self.inner.entity_path, "dropping failed management link");
            *slot = None;
        }
    }
}

impl fmt::Debug for ManagementChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementChannel")
            .field("entity_path", &self.inner.entity_path)
            .field("client_id", &self.inner.client_id)
            .field("users", &self.user_count())
            .finish()
    }
}
