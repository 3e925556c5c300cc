//! Configuration structures for sender and receiver links.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-operation timeout.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum message size assumed until the broker advertises its own.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Credit grants are flushed once this many credits accumulated.
pub const DEFAULT_CREDIT_BATCH_THRESHOLD: u32 = 100;

/// Sender settlement semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderSettleMode {
    /// Deliveries are sent unsettled and settled by the broker.
    Unsettled,
    /// Deliveries are sent pre-settled (at-most-once).
    Settled,
    /// Either, chosen per delivery.
    Mixed,
}

/// Receiver settlement semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverSettleMode {
    /// The receiver settles as soon as it applies the outcome.
    First,
    /// The receiver settles only after the sender settled.
    Second,
}

/// Settle-mode pair negotiated at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleModes {
    /// Sender side.
    pub sender: SenderSettleMode,
    /// Receiver side.
    pub receiver: ReceiverSettleMode,
}

impl SettleModes {
    /// Unsettled sends, receiver settles first. Used for sending and
    /// peek-lock receiving.
    pub const fn at_least_once() -> Self {
        Self {
            sender: SenderSettleMode::Unsettled,
            receiver: ReceiverSettleMode::First,
        }
    }

    /// Pre-settled deliveries. Used for receive-and-delete.
    pub const fn at_most_once() -> Self {
        Self {
            sender: SenderSettleMode::Settled,
            receiver: ReceiverSettleMode::First,
        }
    }
}

/// How a receiver takes ownership of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveMode {
    /// Messages are locked and must be settled explicitly.
    PeekLock,
    /// Messages are deleted as they are delivered.
    ReceiveAndDelete,
}

impl ReceiveMode {
    /// Settle modes implied by this receive mode.
    pub const fn settle_modes(self) -> SettleModes {
        match self {
            ReceiveMode::PeekLock => SettleModes::at_least_once(),
            ReceiveMode::ReceiveAndDelete => SettleModes::at_most_once(),
        }
    }
}

/// Which session a receiver binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// A specific session id.
    Named(String),
    /// Whichever session the broker hands out next.
    NextAvailable,
}

/// Configuration for a sender link.
#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Entity the link sends to.
    pub entity_path: String,

    /// Transfer destination: send via `entity_path` to this path.
    pub via_path: Option<String>,

    /// Settle-mode pair requested at attach.
    pub settle_modes: SettleModes,

    /// Budget of each send, including retries.
    pub operation_timeout: Duration,

    /// Size limit used until the broker advertises one.
    pub max_message_size: usize,

    /// Period of the timeout sweep over pending sends.
    pub sweep_interval: Duration,

    /// How long before token expiry the token is renewed.
    pub token_refresh_margin: Duration,
}

impl SenderConfig {
    /// Defaults for sending to `entity_path`.
    pub fn new(entity_path: impl Into<String>) -> Self {
        Self {
            entity_path: entity_path.into(),
            via_path: None,
            settle_modes: SettleModes::at_least_once(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            sweep_interval: Duration::from_secs(1),
            token_refresh_margin: Duration::from_secs(5 * 60),
        }
    }

    /// Route messages through `entity_path` to `via_path`.
    pub fn with_via(mut self, via_path: impl Into<String>) -> Self {
        self.via_path = Some(via_path.into());
        self
    }

    /// Set the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the sweep period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the size limit assumed before attach.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Path used for the attach target and token audience.
    pub fn target_path(&self) -> &str {
        self.via_path.as_deref().unwrap_or(&self.entity_path)
    }
}

/// Configuration for a receiver link.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// Entity the link receives from.
    pub entity_path: String,

    /// Peek-lock or receive-and-delete.
    pub receive_mode: ReceiveMode,

    /// Settle-mode pair requested at attach.
    pub settle_modes: SettleModes,

    /// Messages buffered ahead of demand. Zero grants credit only for
    /// pending receive calls.
    pub prefetch_count: u32,

    /// Credit grants are batched until this many accumulated.
    pub credit_batch_threshold: u32,

    /// Budget of dispositions and session operations.
    pub operation_timeout: Duration,

    /// Period of the dispatch loop that hands buffered messages to
    /// pending receive calls and flushes batched credit.
    pub dispatch_interval: Duration,

    /// Period of the timeout sweep over pending dispositions.
    pub sweep_interval: Duration,

    /// Session to bind to, if any.
    pub session: Option<SessionRequest>,

    /// Attach to a session without locking it (browse only).
    pub browsable_session: bool,

    /// How long before token expiry the token is renewed.
    pub token_refresh_margin: Duration,
}

impl ReceiverConfig {
    /// Peek-lock defaults for receiving from `entity_path`.
    pub fn new(entity_path: impl Into<String>) -> Self {
        Self {
            entity_path: entity_path.into(),
            receive_mode: ReceiveMode::PeekLock,
            settle_modes: ReceiveMode::PeekLock.settle_modes(),
            prefetch_count: 0,
            credit_batch_threshold: DEFAULT_CREDIT_BATCH_THRESHOLD,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            dispatch_interval: Duration::from_millis(20),
            sweep_interval: Duration::from_secs(1),
            session: None,
            browsable_session: false,
            token_refresh_margin: Duration::from_secs(5 * 60),
        }
    }

    /// Switch receive mode; also resets the settle modes to match.
    pub fn with_receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.receive_mode = mode;
        self.settle_modes = mode.settle_modes();
        self
    }

    /// Set the prefetch count.
    pub fn with_prefetch(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Set the credit batch threshold.
    pub fn with_credit_batch_threshold(mut self, threshold: u32) -> Self {
        self.credit_batch_threshold = threshold.max(1);
        self
    }

    /// Set the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the dispatch period.
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Set the sweep period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Bind to a session.
    pub fn with_session(mut self, session: SessionRequest) -> Self {
        self.session = Some(session);
        self
    }

    /// Browse the session without taking its lock.
    pub fn browsable(mut self) -> Self {
        self.browsable_session = true;
        self
    }
}
