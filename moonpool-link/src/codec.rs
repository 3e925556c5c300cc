//! Pluggable message serialization.
//!
//! The AMQP body codec lives outside this crate. Link managers only need to
//! turn a [`Message`](crate::Message) into wire bytes and back, so they are
//! generic over a [`MessageCodec`]. [`JsonCodec`] is the default and is what
//! the tests use.
//!
//! ```rust
//! use moonpool_link::{JsonCodec, Message, MessageCodec};
//!
//! let codec = JsonCodec;
//! let message = Message::new(b"hello".to_vec()).with_message_id("m-1");
//! let bytes = codec.encode(&message).unwrap();
//! let decoded: Message = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded.message_id.as_deref(), Some("m-1"));
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A message could not be turned into wire bytes or back.
///
/// Converts into a [`LinkError`](crate::LinkError) of kind
/// [`ErrorKind::Codec`](crate::ErrorKind::Codec).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serializing an outbound message failed.
    #[error("encode error: {0}")]
    Encode(#[source] BoxError),
    /// An inbound payload is not a valid message.
    #[error("decode error: {0}")]
    Decode(#[source] BoxError),
}

/// Pluggable message serialization format.
///
/// Codecs are moved into engine tasks that may run on any runtime worker,
/// hence the `Send + Sync` bounds.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// Human-readable, which makes wire captures in tests easy to inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, LinkError, Message};

    #[test]
    fn test_decode_garbage_is_codec_error() {
        use std::error::Error as _;

        let codec = JsonCodec;
        let result: Result<Message, CodecError> = codec.decode(b"not json");
        let err = result.expect_err("garbage should not decode");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.source().is_some(), "serde error kept as source");

        let link_err: LinkError = err.into();
        assert_eq!(link_err.kind(), ErrorKind::Codec);
        assert!(link_err.message().starts_with("decode error"));
    }
}
