//! Sender link manager.
//!
//! [`SenderLinkManager`] is a cheap, cloneable handle. Every call encodes
//! the message on the caller's thread and posts a command to the engine
//! task, which owns the underlying link, the send queue and the pending
//! table:
//!
//! ```text
//! callers ──Command──► engine ◄──(LinkId, LinkEvent)── protocol engine
//!                        │  ▲
//!              spawns    ▼  │ Internal (open result, retry due)
//!                     scheduler tasks
//! ```

mod engine;
mod handle;
mod queue;

use std::time::Duration;

use bytes::Bytes;

use crate::completion::Completer;
use crate::error::{LinkError, LinkResult};
use crate::message::{DeliveryTag, TransactionId};
use crate::pending::PendingWork;
use crate::protocol::{LinkId, RemoteAttach, SenderLink};
use crate::timeout::TimeoutTracker;

pub use handle::SenderLinkManager;

/// Requests from handles to the engine.
pub(crate) enum Command {
    Send {
        payload: Bytes,
        message_format: u32,
        transaction: Option<TransactionId>,
        completer: Completer<()>,
    },
    SendBatch {
        payloads: Vec<Vec<u8>>,
        transaction: Option<TransactionId>,
        completer: Completer<()>,
    },
    Close {
        completer: Completer<()>,
    },
}

impl Command {
    /// Answer a command the engine will never run.
    pub(crate) fn reject(self, error: LinkError) {
        match self {
            Command::Send { completer, .. } | Command::SendBatch { completer, .. } => {
                let _ = completer.complete(Err(error));
            }
            Command::Close { completer } => {
                let _ = completer.complete(Ok(()));
            }
        }
    }
}

/// Results of tasks the engine spawned.
pub(crate) enum Internal {
    Opened {
        link_id: LinkId,
        result: LinkResult<(Box<dyn SenderLink>, RemoteAttach, Duration)>,
    },
    ReopenDue {
        link_id: LinkId,
    },
    RetryDue {
        tag: DeliveryTag,
    },
}

/// One pending send.
pub(crate) struct SendWork {
    pub(crate) payload: Bytes,
    pub(crate) message_format: u32,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) completer: Completer<()>,
    pub(crate) tracker: TimeoutTracker,
    pub(crate) last_error: Option<LinkError>,
    /// Link instance the delivery was last transmitted on, while unsettled.
    pub(crate) transmitted_on: Option<LinkId>,
}

impl PendingWork for SendWork {
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
