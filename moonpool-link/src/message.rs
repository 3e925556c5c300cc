//! Messages, delivery tags and settlement outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, LinkError};

/// Opaque correlation id of one in-flight or unsettled delivery on a link.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(Bytes);

impl DeliveryTag {
    /// Wrap raw tag bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// A fresh random 16-byte tag.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(Bytes::copy_from_slice(&bytes))
    }

    /// Raw tag bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lock token derived from this tag.
    ///
    /// Brokers use the 16-byte delivery tag of a peek-locked message as its
    /// lock token. Other tag lengths have no lock token.
    pub fn lock_token(&self) -> Option<LockToken> {
        let bytes: [u8; 16] = self.0[..].try_into().ok()?;
        Some(LockToken::from_bytes(bytes))
    }
}

impl fmt::Debug for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeliveryTag({})", self)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Lock token of a peek-locked message, in UUID text layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    /// Wrap a lock token received from the broker.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Render 16 bytes as a lock token.
    ///
    /// The first three UUID groups are little-endian on the wire.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let order = [3, 2, 1, 0, 5, 4, 7, 6, 8, 9, 10, 11, 12, 13, 14, 15];
        let mut text = String::with_capacity(36);
        for (i, index) in order.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                text.push('-');
            }
            text.push_str(&format!("{:02x}", bytes[*index]));
        }
        Self(text)
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque transaction handle passed through to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Bytes);

impl TransactionId {
    /// Wrap the transaction id issued by the coordinator.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Properties stamped by the broker on delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerProperties {
    /// Broker-assigned sequence number.
    pub sequence_number: Option<i64>,
    /// When the message was enqueued.
    pub enqueued_time: Option<SystemTime>,
    /// When the peek lock on this message expires.
    pub locked_until: Option<SystemTime>,
    /// How many times the message has been delivered.
    pub delivery_count: u32,
    /// Dead-letter source, when read from a dead-letter queue.
    pub dead_letter_source: Option<String>,
}

/// A message as sent by the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Application message id.
    pub message_id: Option<String>,
    /// Session the message belongs to.
    pub session_id: Option<String>,
    /// Correlation id for request/reply patterns.
    pub correlation_id: Option<String>,
    /// Partition key for partitioned entities.
    pub partition_key: Option<String>,
    /// Time to live.
    pub time_to_live: Option<Duration>,
    /// Enqueue time for scheduled messages.
    pub scheduled_enqueue_time: Option<SystemTime>,
    /// Application properties.
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Opaque body.
    pub body: Bytes,
    /// Set by the broker; ignored on send.
    #[serde(default)]
    pub broker: BrokerProperties,
}

impl Message {
    /// A message with the given body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set the message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the session id.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Add an application property.
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// A message handed to the caller by a receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Decoded message.
    pub message: Message,
    /// Tag of the live delivery. `None` for messages fetched through the
    /// management side-channel, which can only be settled by lock token.
    pub delivery_tag: Option<DeliveryTag>,
    /// Lock token, absent for pre-settled (receive-and-delete) deliveries.
    pub lock_token: Option<LockToken>,
    /// Whether the broker already settled the delivery.
    pub settled: bool,
}

impl ReceivedMessage {
    /// Broker sequence number, if stamped.
    pub fn sequence_number(&self) -> Option<i64> {
        self.message.broker.sequence_number
    }
}

/// Error condition carried by a rejected outcome or a detach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCondition {
    /// Condition symbol, e.g. `amqp:not-found`.
    pub condition: String,
    /// Free-form description.
    pub description: String,
    /// Extra info fields.
    #[serde(default)]
    pub info: BTreeMap<String, serde_json::Value>,
}

impl ErrorCondition {
    /// A condition without info fields.
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: description.into(),
            info: BTreeMap::new(),
        }
    }

    /// Classify the condition.
    pub fn to_error(&self) -> LinkError {
        LinkError::from_condition(&self.condition, self.description.clone())
    }
}

/// Condition symbol used to dead-letter a message.
pub const DEAD_LETTER_CONDITION: &str = "com.microsoft:dead-letter";
/// Info key carrying the dead-letter reason.
pub const DEAD_LETTER_REASON: &str = "DeadLetterReason";
/// Info key carrying the dead-letter description.
pub const DEAD_LETTER_DESCRIPTION: &str = "DeadLetterErrorDescription";

/// Settlement outcome of a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Processed successfully.
    Accepted,
    /// Returned to the entity with modified annotations.
    Modified {
        /// Count this attempt as a failed delivery.
        delivery_failed: bool,
        /// Do not redeliver on this link (used for defer).
        undeliverable_here: bool,
        /// Annotations to merge into the message.
        annotations: BTreeMap<String, serde_json::Value>,
    },
    /// Rejected; for dispositions this dead-letters the message.
    Rejected(Option<ErrorCondition>),
    /// Released by the broker without processing.
    Released,
}

impl Outcome {
    /// Abandon: release the lock and let the message be redelivered.
    pub fn abandon(annotations: BTreeMap<String, serde_json::Value>) -> Self {
        Outcome::Modified {
            delivery_failed: true,
            undeliverable_here: false,
            annotations,
        }
    }

    /// Defer: keep the message aside, retrievable by sequence number.
    pub fn defer(annotations: BTreeMap<String, serde_json::Value>) -> Self {
        Outcome::Modified {
            delivery_failed: false,
            undeliverable_here: true,
            annotations,
        }
    }

    /// Dead-letter with an optional reason and description.
    pub fn dead_letter(
        reason: Option<String>,
        description: Option<String>,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut condition = ErrorCondition::new(DEAD_LETTER_CONDITION, "");
        condition.info = properties;
        if let Some(reason) = reason {
            condition
                .info
                .insert(DEAD_LETTER_REASON.to_string(), reason.into());
        }
        if let Some(description) = description {
            condition
                .info
                .insert(DEAD_LETTER_DESCRIPTION.to_string(), description.into());
        }
        Outcome::Rejected(Some(condition))
    }

    /// Variant discriminant, used to compare requested and remote outcomes.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Accepted => OutcomeKind::Accepted,
            Outcome::Modified { .. } => OutcomeKind::Modified,
            Outcome::Rejected(_) => OutcomeKind::Rejected,
            Outcome::Released => OutcomeKind::Released,
        }
    }

    /// Error carried by a rejected outcome that is not a dead-letter.
    pub fn rejection_error(&self) -> Option<LinkError> {
        match self {
            Outcome::Rejected(Some(condition)) if condition.condition == DEAD_LETTER_CONDITION => {
                None
            }
            Outcome::Rejected(Some(condition)) => Some(condition.to_error()),
            Outcome::Rejected(None) => Some(
                LinkError::new(ErrorKind::Internal, "delivery rejected without a condition")
                    .with_transient(false),
            ),
            _ => None,
        }
    }
}

/// Discriminant of [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// [`Outcome::Accepted`]
    Accepted,
    /// [`Outcome::Modified`]
    Modified,
    /// [`Outcome::Rejected`]
    Rejected,
    /// [`Outcome::Released`]
    Released,
}

/// Target state of a disposition sent through the management side-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispositionStatus {
    /// Complete the message.
    Completed,
    /// Abandon the message.
    Abandoned,
    /// Defer the message.
    Deferred,
    /// Dead-letter the message.
    Suspended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_token_layout() {
        let bytes = [
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        let tag = DeliveryTag::new(bytes.to_vec());
        let token = tag.lock_token().expect("16-byte tag has a lock token");
        assert_eq!(token.as_str(), "00112233-4455-6677-8899-aabbccddeeff");

        assert!(DeliveryTag::new(vec![1, 2, 3]).lock_token().is_none());
    }

    #[test]
    fn test_random_tags_differ() {
        assert_ne!(DeliveryTag::random(), DeliveryTag::random());
    }

    #[test]
    fn test_dead_letter_is_not_a_rejection_error() {
        let outcome = Outcome::dead_letter(Some("poison".into()), None, BTreeMap::new());
        assert_eq!(outcome.kind(), OutcomeKind::Rejected);
        assert!(outcome.rejection_error().is_none());

        let rejected = Outcome::Rejected(Some(ErrorCondition::new(
            "com.microsoft:server-busy",
            "busy",
        )));
        let err = rejected.rejection_error().expect("real rejection");
        assert_eq!(err.kind(), ErrorKind::ServerBusy);
    }
}
