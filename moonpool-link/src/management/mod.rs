//! Request/response side-channel for management operations.
//!
//! Operations that do not flow through a send or receive link (lock
//! renewal, deferred fetch, scheduling, peeking, disposition by lock token,
//! session state) are requests on the entity's `$management` link. The
//! protocol engine correlates requests and responses; this module defines
//! the typed requests and a shared, lazily attached [`ManagementChannel`].

mod channel;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ReceiveMode;
use crate::error::{ErrorKind, LinkError, LinkResult};
use crate::message::{DispositionStatus, LockToken, Message, ReceivedMessage, TransactionId};

pub use channel::ManagementChannel;

/// A management request.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementRequest {
    /// Extend the locks of peek-locked messages.
    RenewMessageLocks {
        /// Locks to renew.
        lock_tokens: Vec<LockToken>,
    },
    /// Fetch deferred messages by sequence number.
    ReceiveBySequenceNumbers {
        /// Sequence numbers to fetch.
        sequence_numbers: Vec<i64>,
        /// How the fetched messages are taken.
        receive_mode: ReceiveMode,
        /// Session the messages belong to.
        session_id: Option<String>,
    },
    /// Settle messages identified by lock token.
    UpdateDisposition {
        /// Messages to settle.
        lock_tokens: Vec<LockToken>,
        /// Target state.
        status: DispositionStatus,
        /// Dead-letter reason, for [`DispositionStatus::Suspended`].
        dead_letter_reason: Option<String>,
        /// Dead-letter description, for [`DispositionStatus::Suspended`].
        dead_letter_description: Option<String>,
        /// Properties to merge into the messages.
        properties: BTreeMap<String, serde_json::Value>,
        /// Session the messages belong to.
        session_id: Option<String>,
    },
    /// Extend the session lock.
    RenewSessionLock {
        /// Locked session.
        session_id: String,
    },
    /// Read the session state.
    GetSessionState {
        /// Session to read.
        session_id: String,
    },
    /// Replace the session state; `None` clears it.
    SetSessionState {
        /// Session to update.
        session_id: String,
        /// New state.
        state: Option<Bytes>,
    },
    /// Browse messages without locking them.
    PeekMessages {
        /// First sequence number to return.
        from_sequence_number: i64,
        /// Maximum number of messages.
        count: u32,
        /// Session to browse, if any.
        session_id: Option<String>,
    },
    /// Schedule messages for later enqueueing.
    ScheduleMessages {
        /// Messages carrying their scheduled enqueue time.
        messages: Vec<Message>,
    },
    /// Cancel scheduled messages.
    CancelScheduledMessages {
        /// Sequence numbers returned when scheduling.
        sequence_numbers: Vec<i64>,
    },
}

impl ManagementRequest {
    /// Operation name carried in the request's application properties.
    pub fn operation(&self) -> &'static str {
        match self {
            ManagementRequest::RenewMessageLocks { .. } => "com.microsoft:renew-lock",
            ManagementRequest::ReceiveBySequenceNumbers { .. } => {
                "com.microsoft:receive-by-sequence-number"
            }
            ManagementRequest::UpdateDisposition { .. } => "com.microsoft:update-disposition",
            ManagementRequest::RenewSessionLock { .. } => "com.microsoft:renew-session-lock",
            ManagementRequest::GetSessionState { .. } => "com.microsoft:get-session-state",
            ManagementRequest::SetSessionState { .. } => "com.microsoft:set-session-state",
            ManagementRequest::PeekMessages { .. } => "com.microsoft:peek-message",
            ManagementRequest::ScheduleMessages { .. } => "com.microsoft:schedule-message",
            ManagementRequest::CancelScheduledMessages { .. } => {
                "com.microsoft:cancel-scheduled-message"
            }
        }
    }
}

impl fmt::Display for ManagementRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

/// A management response.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagementResponse {
    /// Success without a body.
    Empty,
    /// New lock expiries, one per renewed token.
    LockedUntil(Vec<SystemTime>),
    /// New session lock expiry.
    SessionLockedUntil(SystemTime),
    /// Fetched or peeked messages.
    Messages(Vec<ReceivedMessage>),
    /// Sequence numbers of scheduled messages.
    SequenceNumbers(Vec<i64>),
    /// Session state.
    SessionState(Option<Bytes>),
}

impl ManagementResponse {
    fn unexpected(self, expected: &str) -> LinkError {
        LinkError::new(
            ErrorKind::Internal,
            format!("expected {} response, got {:?}", expected, self),
        )
        .with_transient(false)
    }

    /// Expect a body-less success.
    pub fn into_empty(self) -> LinkResult<()> {
        match self {
            ManagementResponse::Empty => Ok(()),
            other => Err(other.unexpected("empty")),
        }
    }

    /// Expect lock expiries.
    pub fn into_locked_until(self) -> LinkResult<Vec<SystemTime>> {
        match self {
            ManagementResponse::LockedUntil(times) => Ok(times),
            other => Err(other.unexpected("lock expiry")),
        }
    }

    /// Expect a session lock expiry.
    pub fn into_session_locked_until(self) -> LinkResult<SystemTime> {
        match self {
            ManagementResponse::SessionLockedUntil(time) => Ok(time),
            other => Err(other.unexpected("session lock expiry")),
        }
    }

    /// Expect messages.
    pub fn into_messages(self) -> LinkResult<Vec<ReceivedMessage>> {
        match self {
            ManagementResponse::Messages(messages) => Ok(messages),
            other => Err(other.unexpected("messages")),
        }
    }

    /// Expect sequence numbers.
    pub fn into_sequence_numbers(self) -> LinkResult<Vec<i64>> {
        match self {
            ManagementResponse::SequenceNumbers(numbers) => Ok(numbers),
            other => Err(other.unexpected("sequence numbers")),
        }
    }

    /// Expect session state.
    pub fn into_session_state(self) -> LinkResult<Option<Bytes>> {
        match self {
            ManagementResponse::SessionState(state) => Ok(state),
            other => Err(other.unexpected("session state")),
        }
    }
}

/// Correlated request/response link provided by the protocol engine.
#[async_trait]
pub trait RequestResponseLink: Send + Sync {
    /// Send `request` and wait up to `timeout` for its response.
    async fn request(
        &self,
        request: ManagementRequest,
        transaction: Option<TransactionId>,
        timeout: Duration,
    ) -> LinkResult<ManagementResponse>;

    /// Detach the link.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        let request = ManagementRequest::RenewSessionLock {
            session_id: "s-1".to_string(),
        };
        assert_eq!(request.to_string(), "com.microsoft:renew-session-lock");
    }

    #[test]
    fn test_unexpected_response_is_fatal() {
        let err = ManagementResponse::Empty
            .into_messages()
            .expect_err("wrong shape");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_transient());
        assert_eq!(
            ManagementResponse::SequenceNumbers(vec![4, 5])
                .into_sequence_numbers()
                .expect("numbers"),
            vec![4, 5]
        );
    }
}
