//! Receiver link manager.
//!
//! Same shape as the sender: a cloneable [`ReceiverLinkManager`] handle in
//! front of a single engine task. The engine owns the link, the credit
//! controller, the prefetch buffer, the map of unsettled deliveries and the
//! pending dispositions. It also publishes a [`LinkStatus`] snapshot so that
//! handles can refuse calls on an unusable link without a round trip.
//!
//! [`LinkStatus`]: crate::LinkStatus

mod engine;
mod handle;
mod prefetch;

use std::time::{Duration, SystemTime};

use crate::completion::Completer;
use crate::error::{LinkError, LinkResult};
use crate::message::{DeliveryTag, Outcome, ReceivedMessage, TransactionId};
use crate::pending::PendingWork;
use crate::protocol::{LinkId, ReceiverLink, RemoteAttach};
use crate::timeout::TimeoutTracker;

pub use handle::ReceiverLinkManager;

/// Requests from handles to the engine.
pub(crate) enum Command {
    Receive {
        max_messages: u32,
        timeout: Duration,
        completer: Completer<Vec<ReceivedMessage>>,
    },
    Settle {
        tag: DeliveryTag,
        outcome: Outcome,
        transaction: Option<TransactionId>,
        completer: Completer<()>,
    },
    /// Attach without waiting for a receive call.
    Open,
    SessionLockRenewed {
        locked_until: SystemTime,
    },
    SessionLockLost {
        error: LinkError,
    },
    Close {
        completer: Completer<()>,
    },
}

impl Command {
    /// Answer a command the engine will never run.
    pub(crate) fn reject(self, error: LinkError) {
        match self {
            Command::Receive { completer, .. } => {
                let _ = completer.complete(Err(error));
            }
            Command::Settle { completer, .. } => {
                let _ = completer.complete(Err(error));
            }
            Command::Close { completer } => {
                let _ = completer.complete(Ok(()));
            }
            Command::Open
            | Command::SessionLockRenewed { .. }
            | Command::SessionLockLost { .. } => {}
        }
    }
}

/// Results of tasks the engine spawned.
pub(crate) enum Internal {
    Opened {
        link_id: LinkId,
        result: LinkResult<(Box<dyn ReceiverLink>, RemoteAttach, Duration)>,
    },
    ReopenDue {
        link_id: LinkId,
    },
    DispositionRetryDue {
        tag: DeliveryTag,
    },
}

/// One pending receive call.
pub(crate) struct ReceiveWork {
    pub(crate) max_messages: u32,
    pub(crate) completer: Completer<Vec<ReceivedMessage>>,
    pub(crate) tracker: TimeoutTracker,
}

/// One pending disposition.
pub(crate) struct DispositionWork {
    pub(crate) outcome: Outcome,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) completer: Completer<()>,
    pub(crate) tracker: TimeoutTracker,
    pub(crate) last_error: Option<LinkError>,
}

impl PendingWork for DispositionWork {
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
