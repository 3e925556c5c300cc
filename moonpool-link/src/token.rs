//! Authorization token renewal.
//!
//! A token for the link's audience is obtained before every link creation.
//! While the link lives, a background task renews it `validity - margin`
//! after each successful renewal. The task is cancelled together with the
//! link instance it was started for.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::LinkResult;
use crate::scheduler::Scheduler;

/// Delay before retrying a failed background renewal.
const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Shortest wait between two renewals.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// Obtains authorization tokens for link audiences.
#[async_trait]
pub trait TokenRenewer: Send + Sync + 'static {
    /// Put a fresh token for `audience` on the connection. Returns how long
    /// the token stays valid.
    async fn renew(&self, audience: &str) -> LinkResult<Duration>;
}

/// Renews the token of one audience on behalf of a link manager.
#[derive(Clone)]
pub(crate) struct TokenRefresher {
    renewer: Arc<dyn TokenRenewer>,
    audience: String,
    margin: Duration,
}

impl TokenRefresher {
    pub(crate) fn new(renewer: Arc<dyn TokenRenewer>, audience: String, margin: Duration) -> Self {
        Self {
            renewer,
            audience,
            margin,
        }
    }

    /// Obtain a token ahead of a link creation.
    pub(crate) async fn authorize(&self) -> LinkResult<Duration> {
        let validity = self.renewer.renew(&self.audience).await?;
        tracing::debug!(audience = %self.audience, ?validity, "token renewed");
        Ok(validity)
    }

    /// Delay until the token obtained with `validity` must be renewed.
    pub(crate) fn renewal_delay(&self, validity: Duration) -> Duration {
        validity.saturating_sub(self.margin).max(MIN_RENEWAL_DELAY)
    }

    /// Keep renewing the token until `cancel` fires.
    pub(crate) fn spawn_renewal(
        &self,
        scheduler: &Scheduler,
        validity: Duration,
        cancel: CancellationToken,
    ) {
        let refresher = self.clone();
        let name = format!("token-renewal:{}", self.audience);
        scheduler.spawn_task(&name, async move {
            let mut delay = refresher.renewal_delay(validity);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = match refresher.authorize().await {
                    Ok(validity) => refresher.renewal_delay(validity),
                    Err(e) => {
                        tracing::warn!(audience = %refresher.audience, error = %e, "token renewal failed");
                        RENEWAL_RETRY_DELAY
                    }
                };
            }
        });
    }
}
