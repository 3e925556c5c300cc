//! Interfaces to the AMQP protocol engine.
//!
//! The protocol engine (frame codec, connection, sessions) lives outside this
//! crate. Link managers talk to it through three narrow seams:
//!
//! - [`LinkFactory`] attaches new links and resolves once the remote attach
//!   arrived.
//! - [`SenderLink`] / [`ReceiverLink`] perform wire actions on an attached
//!   link. They only queue frames and never block.
//! - [`LinkEventSink`] is how the protocol engine reports link events back.
//!   Emitting marshals the event onto the owning manager's engine task, so
//!   protocol callbacks never touch manager state directly.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{SessionRequest, SettleModes};
use crate::error::{LinkError, LinkResult};
use crate::management::RequestResponseLink;
use crate::message::{DeliveryTag, Outcome, TransactionId};

/// Identifies one underlying link instance of a manager.
///
/// A manager gets a new id each time it recreates its link, so events from a
/// previous instance can be told apart and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    /// Wrap a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The id following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// A delivery received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    /// Delivery tag chosen by the broker.
    pub tag: DeliveryTag,
    /// Encoded message.
    pub payload: Bytes,
    /// Whether the broker sent the delivery pre-settled.
    pub settled: bool,
}

/// A delivery handed to the protocol engine for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDelivery {
    /// Delivery tag chosen by the sender.
    pub tag: DeliveryTag,
    /// Encoded message or batch envelope.
    pub payload: Bytes,
    /// AMQP message format code.
    pub message_format: u32,
    /// Send pre-settled.
    pub settled: bool,
    /// Transaction the delivery is enlisted in.
    pub transaction: Option<TransactionId>,
}

/// Event reported by the protocol engine for one link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The broker granted sender credit. The value is the new total
    /// link credit, not an increment.
    Credit(u32),
    /// The remote settled a delivery.
    Settled {
        /// Delivery being settled.
        tag: DeliveryTag,
        /// Remote outcome.
        outcome: Outcome,
    },
    /// A message arrived on a receiver link.
    Delivery(InboundDelivery),
    /// The link detached, cleanly (`None`) or with an error.
    Detached(Option<LinkError>),
}

/// Channel end the protocol engine uses to report events for one link.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    link_id: LinkId,
    tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>,
}

impl LinkEventSink {
    pub(crate) fn new(link_id: LinkId, tx: mpsc::UnboundedSender<(LinkId, LinkEvent)>) -> Self {
        Self { link_id, tx }
    }

    /// Link instance this sink reports for.
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Queue `event` onto the owning manager's engine.
    ///
    /// Returns `false` when the manager is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx.send((self.link_id, event)).is_ok()
    }

    /// Whether the owning manager stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Parameters of a sender attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderAttach {
    /// Link name, unique per manager instance.
    pub name: String,
    /// Target entity.
    pub entity_path: String,
    /// Final destination when sending via `entity_path`.
    pub via_path: Option<String>,
    /// Requested settle modes.
    pub settle_modes: SettleModes,
}

/// Parameters of a receiver attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverAttach {
    /// Link name, unique per manager instance.
    pub name: String,
    /// Source entity.
    pub entity_path: String,
    /// Requested settle modes.
    pub settle_modes: SettleModes,
    /// Session filter.
    pub session: Option<SessionRequest>,
    /// Attach without taking the session lock.
    pub browsable_session: bool,
}

/// Properties of the remote attach frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAttach {
    /// Largest message the broker accepts on this link.
    pub max_message_size: Option<usize>,
    /// Session bound to a session receiver.
    pub session_id: Option<String>,
    /// Session lock expiry.
    pub session_locked_until: Option<SystemTime>,
}

/// Wire actions on an attached sender link.
#[async_trait]
pub trait SenderLink: Send + Sync {
    /// Transmit one delivery. Consumes one unit of link credit.
    fn transmit(&self, delivery: OutboundDelivery) -> LinkResult<()>;

    /// Detach the link.
    async fn close(&self);
}

/// Wire actions on an attached receiver link.
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Grant `credit` additional deliveries.
    fn flow(&self, credit: u32) -> LinkResult<()>;

    /// Revoke all outstanding credit. Deliveries already in flight may
    /// still arrive.
    fn drain(&self) -> LinkResult<()>;

    /// Send a disposition for an unsettled delivery.
    fn disposition(
        &self,
        tag: &DeliveryTag,
        outcome: &Outcome,
        transaction: Option<&TransactionId>,
    ) -> LinkResult<()>;

    /// Settle a delivery locally once its disposition was acknowledged.
    fn settle(&self, tag: &DeliveryTag);

    /// Detach the link.
    async fn close(&self);
}

/// Creates links on the shared connection.
#[async_trait]
pub trait LinkFactory: Send + Sync + 'static {
    /// Attach a sender link. Events for it must be reported on `events`.
    async fn create_sender(
        &self,
        attach: SenderAttach,
        events: LinkEventSink,
    ) -> LinkResult<(Box<dyn SenderLink>, RemoteAttach)>;

    /// Attach a receiver link. Events for it must be reported on `events`.
    async fn create_receiver(
        &self,
        attach: ReceiverAttach,
        events: LinkEventSink,
    ) -> LinkResult<(Box<dyn ReceiverLink>, RemoteAttach)>;

    /// Attach the request/response link of `entity_path`.
    async fn create_request_response(
        &self,
        entity_path: &str,
    ) -> LinkResult<std::sync::Arc<dyn RequestResponseLink>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events_with_link_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = LinkEventSink::new(LinkId::new(3), tx);
        assert!(sink.emit(LinkEvent::Credit(10)));
        let (id, event) = rx.try_recv().expect("event queued");
        assert_eq!(id, LinkId::new(3));
        assert!(matches!(event, LinkEvent::Credit(10)));

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(LinkEvent::Detached(None)));
    }

    #[test]
    fn test_link_id_sequence() {
        let first = LinkId::new(1);
        assert_eq!(first.next(), LinkId::new(2));
        assert_eq!(first.to_string(), "link-1");
    }
}
