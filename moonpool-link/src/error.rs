//! Error types for link operations.
//!
//! Every failure surfaced by this crate is a [`LinkError`]: a flat record of
//! an [`ErrorKind`], a transience flag and an optional cause. Classification
//! is a `match` on the kind, never a type hierarchy.
//!
//! Callers usually only care about the [`ErrorCategory`]:
//! - [`ErrorCategory::RetryLater`]: the operation may succeed if issued again
//! - [`ErrorCategory::Fatal`]: the client must be recreated
//! - [`ErrorCategory::CallerError`]: the input or call sequence is wrong

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The broker is overloaded and asks clients to back off.
    ServerBusy,
    /// Transient link or connection failure.
    Communication,
    /// The operation ran out of time.
    Timeout,
    /// The broker reported an internal error.
    Internal,
    /// The entity (queue, topic, subscription) does not exist.
    EntityNotFound,
    /// The entity exists but is disabled.
    EntityDisabled,
    /// The credentials do not grant access to the entity.
    Unauthorized,
    /// An entity quota was exceeded.
    QuotaExceeded,
    /// The session lock held by this receiver is gone.
    SessionLockLost,
    /// The requested session could not be locked.
    SessionCannotBeLocked,
    /// The lock on a message expired or was lost.
    MessageLockLost,
    /// A message addressed by sequence number does not exist.
    MessageNotFound,
    /// A disposition targeted a delivery this link no longer knows.
    DeliveryNotFound,
    /// The payload exceeds the link's maximum message size.
    PayloadTooLarge,
    /// The operation was cancelled by the broker or by closing the link.
    Cancelled,
    /// The operation is not valid in the link's current state.
    IllegalState,
    /// An argument was out of range.
    InvalidArgument,
    /// The operation is not supported by this link's configuration.
    InvalidOperation,
    /// A message could not be encoded or decoded.
    Codec,
}

impl ErrorKind {
    /// Whether failures of this kind are retryable unless stated otherwise.
    pub const fn is_transient_by_default(self) -> bool {
        matches!(
            self,
            ErrorKind::ServerBusy
                | ErrorKind::Communication
                | ErrorKind::Timeout
                | ErrorKind::Internal
        )
    }

    /// Stable lower-case name, used in log fields and `Display`.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ServerBusy => "server-busy",
            ErrorKind::Communication => "communication",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
            ErrorKind::EntityNotFound => "entity-not-found",
            ErrorKind::EntityDisabled => "entity-disabled",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::QuotaExceeded => "quota-exceeded",
            ErrorKind::SessionLockLost => "session-lock-lost",
            ErrorKind::SessionCannotBeLocked => "session-cannot-be-locked",
            ErrorKind::MessageLockLost => "message-lock-lost",
            ErrorKind::MessageNotFound => "message-not-found",
            ErrorKind::DeliveryNotFound => "delivery-not-found",
            ErrorKind::PayloadTooLarge => "payload-too-large",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IllegalState => "illegal-state",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::InvalidOperation => "invalid-operation",
            ErrorKind::Codec => "codec",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Issue the operation again later.
    RetryLater,
    /// The client or link is unusable and must be recreated.
    Fatal,
    /// The input or the call sequence is wrong.
    CallerError,
}

/// Error returned by every link operation.
#[derive(Debug, Clone, Error)]
#[error("{message} ({kind})")]
pub struct LinkError {
    kind: ErrorKind,
    transient: bool,
    message: String,
    #[source]
    cause: Option<Arc<LinkError>>,
}

impl LinkError {
    /// Create an error with the kind's default transience.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            transient: kind.is_transient_by_default(),
            message: message.into(),
            cause: None,
        }
    }

    /// Override the transience flag.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// Attach the error that caused this one.
    pub fn with_cause(mut self, cause: LinkError) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Map a broker error condition symbol to an error.
    ///
    /// Unknown conditions are treated as non-transient internal failures
    /// so they are surfaced instead of retried forever.
    pub fn from_condition(condition: &str, description: impl Into<String>) -> Self {
        let kind = match condition {
            "com.microsoft:server-busy" => ErrorKind::ServerBusy,
            "com.microsoft:timeout" => ErrorKind::Timeout,
            "amqp:internal-error" => ErrorKind::Internal,
            "amqp:not-found" | "com.microsoft:entity-not-found" => ErrorKind::EntityNotFound,
            "com.microsoft:entity-disabled" => ErrorKind::EntityDisabled,
            "amqp:unauthorized-access" => ErrorKind::Unauthorized,
            "amqp:resource-limit-exceeded" => ErrorKind::QuotaExceeded,
            "com.microsoft:session-lock-lost" => ErrorKind::SessionLockLost,
            "com.microsoft:session-cannot-be-locked" => ErrorKind::SessionCannotBeLocked,
            "com.microsoft:message-lock-lost" => ErrorKind::MessageLockLost,
            "com.microsoft:message-not-found" => ErrorKind::MessageNotFound,
            "amqp:link:message-size-exceeded" => ErrorKind::PayloadTooLarge,
            "amqp:link:detach-forced"
            | "amqp:link:stolen"
            | "amqp:connection:forced"
            | "amqp:connection:framing-error"
            | "proton:io" => ErrorKind::Communication,
            "amqp:not-allowed" | "amqp:not-implemented" => ErrorKind::InvalidOperation,
            "amqp:invalid-field" | "amqp:decode-error" => ErrorKind::InvalidArgument,
            _ => {
                return LinkError::new(ErrorKind::Internal, description)
                    .with_transient(false);
            }
        };
        LinkError::new(kind, description)
    }

    /// Shorthand for an [`ErrorKind::IllegalState`] error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState, message)
    }

    /// Shorthand for an [`ErrorKind::Cancelled`] error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Shorthand for an [`ErrorKind::Timeout`] error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Human readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying error, if any.
    pub fn cause(&self) -> Option<&LinkError> {
        self.cause.as_deref()
    }

    /// Whether this error ends the session lock of a session receiver.
    pub fn is_session_lock_lost(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::SessionLockLost | ErrorKind::SessionCannotBeLocked
        )
    }

    /// What the caller should do about this error.
    pub fn category(&self) -> ErrorCategory {
        if self.transient {
            return ErrorCategory::RetryLater;
        }
        match self.kind {
            ErrorKind::PayloadTooLarge
            | ErrorKind::InvalidArgument
            | ErrorKind::InvalidOperation
            | ErrorKind::DeliveryNotFound
            | ErrorKind::MessageLockLost
            | ErrorKind::MessageNotFound
            | ErrorKind::Codec => ErrorCategory::CallerError,
            ErrorKind::ServerBusy
            | ErrorKind::Communication
            | ErrorKind::Timeout
            | ErrorKind::QuotaExceeded
            | ErrorKind::Cancelled => ErrorCategory::RetryLater,
            ErrorKind::Internal
            | ErrorKind::EntityNotFound
            | ErrorKind::EntityDisabled
            | ErrorKind::Unauthorized
            | ErrorKind::SessionLockLost
            | ErrorKind::SessionCannotBeLocked
            | ErrorKind::IllegalState => ErrorCategory::Fatal,
        }
    }
}

impl From<crate::codec::CodecError> for LinkError {
    fn from(err: crate::codec::CodecError) -> Self {
        LinkError::new(ErrorKind::Codec, err.to_string())
    }
}

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
