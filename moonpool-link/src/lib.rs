//! # Moonpool Link
//!
//! Client-side AMQP link management for a message broker.
//!
//! This crate sits between a public messaging client and an AMQP protocol
//! engine. It provides:
//! - **Sender link manager**: reliable sends with credit-driven dispatch,
//!   retries on transient rejections and transparent link recreation
//! - **Receiver link manager**: prefetching receives served in call order,
//!   settlement (complete, abandon, defer, dead-letter) and session binding
//! - **Credit flow control**: batched credit grants that keep the prefetch
//!   buffer topped up without flooding the wire
//! - **Management side-channel**: lock renewal, deferred fetch, scheduling,
//!   peeking and session state over a shared request/response link
//!
//! Every manager is a cheap, cloneable handle in front of a single engine
//! task that owns all wire-affecting state. Operations return a
//! [`Completion`] immediately; it resolves once the broker answered, the
//! operation timed out, or the manager closed.
//!
//! The protocol engine itself is a collaborator: implement [`LinkFactory`],
//! [`SenderLink`], [`ReceiverLink`], [`RequestResponseLink`] and
//! [`TokenRenewer`] to plug one in.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Error kinds and classification.
pub mod error;

/// Sender and receiver configuration.
pub mod config;

/// Operation deadlines.
pub mod timeout;

/// Retry policies.
pub mod retry;

/// Pending operation table swept for timeouts.
pub mod pending;

/// Receiver credit arithmetic.
pub mod credit;

/// Single-assignment operation results.
pub mod completion;

/// Explicitly owned task scheduler.
pub mod scheduler;

/// Pluggable message serialization.
pub mod codec;

/// Messages, delivery tags and outcomes.
pub mod message;

/// Batch envelope framing.
pub mod batch;

/// Seams to the AMQP protocol engine.
pub mod protocol;

/// Token renewal ahead of link creation.
pub mod token;

/// Request/response management side-channel.
pub mod management;

/// Link lifecycle state.
pub mod state;

mod receiver;
mod sender;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use batch::{BATCH_MESSAGE_FORMAT, SINGLE_MESSAGE_FORMAT};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use completion::{Completer, Completion, completion};
pub use config::{
    ReceiveMode, ReceiverConfig, ReceiverSettleMode, SenderConfig, SenderSettleMode,
    SessionRequest, SettleModes,
};
pub use credit::{CreditDecision, CreditFlowController, CreditSnapshot, compute_credit};
pub use error::{ErrorCategory, ErrorKind, LinkError, LinkResult};
pub use management::{
    ManagementChannel, ManagementRequest, ManagementResponse, RequestResponseLink,
};
pub use message::{
    BrokerProperties, DeliveryTag, DispositionStatus, ErrorCondition, LockToken, Message,
    Outcome, OutcomeKind, ReceivedMessage, TransactionId,
};
pub use pending::{PendingTable, PendingWork};
pub use protocol::{
    InboundDelivery, LinkEvent, LinkEventSink, LinkFactory, LinkId, OutboundDelivery,
    ReceiverAttach, ReceiverLink, RemoteAttach, SenderAttach, SenderLink,
};
pub use receiver::ReceiverLinkManager;
pub use retry::{ExponentialRetry, NoRetry, RetryCounters, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerLease};
pub use sender::SenderLinkManager;
pub use state::{LinkState, LinkStatus};
pub use timeout::TimeoutTracker;
pub use token::TokenRenewer;
