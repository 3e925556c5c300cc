//! Batch envelope for sending several messages in one delivery.
//!
//! A batch is one wire delivery with message format [`BATCH_MESSAGE_FORMAT`]
//! whose body is a sequence of AMQP `data` sections, one per encoded
//! message:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │ 0x00 0x53 0x75│ 0xa0 len:u8  │ bytes                │  short payload
//! ├──────────────┼──────────────┼──────────────────────┤
//! │ 0x00 0x53 0x75│ 0xb0 len:u32 │ bytes                │  long payload
//! └──────────────┴──────────────┴──────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, LinkError, LinkResult};

/// Message format of a single message delivery.
pub const SINGLE_MESSAGE_FORMAT: u32 = 0;

/// Message format of a batch delivery.
pub const BATCH_MESSAGE_FORMAT: u32 = 0x8001_3700;

/// Described-type prefix of an AMQP `data` section.
const DATA_SECTION_DESCRIPTOR: [u8; 3] = [0x00, 0x53, 0x75];

const VBIN8: u8 = 0xa0;
const VBIN32: u8 = 0xb0;

/// Encoded size of one data section holding `len` bytes.
pub fn data_section_len(len: usize) -> usize {
    let header = if len <= u8::MAX as usize { 2 } else { 5 };
    DATA_SECTION_DESCRIPTOR.len() + header + len
}

/// Frame encoded messages into one batch body.
///
/// Nothing is produced unless the whole batch fits in `max_size`.
///
/// # Errors
///
/// - [`ErrorKind::InvalidArgument`] for an empty batch
/// - [`ErrorKind::PayloadTooLarge`] when the envelope exceeds `max_size`
pub fn encode_batch(payloads: &[Vec<u8>], max_size: usize) -> LinkResult<Bytes> {
    if payloads.is_empty() {
        return Err(LinkError::new(
            ErrorKind::InvalidArgument,
            "cannot send an empty batch",
        ));
    }

    let total: usize = payloads.iter().map(|p| data_section_len(p.len())).sum();
    if total > max_size {
        return Err(LinkError::new(
            ErrorKind::PayloadTooLarge,
            format!(
                "batch of {} messages is {} bytes, link allows {}",
                payloads.len(),
                total,
                max_size
            ),
        ));
    }

    let mut buf = BytesMut::with_capacity(total);
    for payload in payloads {
        buf.put_slice(&DATA_SECTION_DESCRIPTOR);
        match u8::try_from(payload.len()) {
            Ok(len) => {
                buf.put_u8(VBIN8);
                buf.put_u8(len);
            }
            Err(_) => {
                let len = u32::try_from(payload.len()).map_err(|_| {
                    LinkError::new(ErrorKind::PayloadTooLarge, "message exceeds 4 GiB")
                })?;
                buf.put_u8(VBIN32);
                buf.put_u32(len);
            }
        }
        buf.put_slice(payload);
    }
    Ok(buf.freeze())
}

/// Split a batch body back into its messages.
///
/// # Errors
///
/// [`ErrorKind::Codec`] when the body is not a sequence of data sections.
pub fn decode_batch(body: &[u8]) -> LinkResult<Vec<Bytes>> {
    let malformed = |what: &str| LinkError::new(ErrorKind::Codec, format!("malformed batch: {}", what));
    let mut buf = body;
    let mut messages = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < DATA_SECTION_DESCRIPTOR.len() + 1
            || buf[..DATA_SECTION_DESCRIPTOR.len()] != DATA_SECTION_DESCRIPTOR
        {
            return Err(malformed("expected data section"));
        }
        buf.advance(DATA_SECTION_DESCRIPTOR.len());

        let len = match buf.get_u8() {
            VBIN8 if buf.remaining() >= 1 => buf.get_u8() as usize,
            VBIN32 if buf.remaining() >= 4 => buf.get_u32() as usize,
            _ => return Err(malformed("bad binary constructor")),
        };
        if buf.remaining() < len {
            return Err(malformed("truncated section"));
        }
        messages.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_and_long_sections() {
        let short = vec![7u8; 10];
        let long = vec![9u8; 300];
        let body = encode_batch(&[short.clone(), long.clone()], 1024).expect("fits");

        assert_eq!(&body[..5], &[0x00, 0x53, 0x75, 0xa0, 10]);
        let second = 5 + 10;
        assert_eq!(
            &body[second..second + 8],
            &[0x00, 0x53, 0x75, 0xb0, 0, 0, 0x01, 0x2c]
        );
        assert_eq!(body.len(), data_section_len(10) + data_section_len(300));

        let parts = decode_batch(&body).expect("well formed");
        assert_eq!(parts, vec![Bytes::from(short), Bytes::from(long)]);
    }

    #[test]
    fn test_oversized_batch_is_rejected_whole() {
        let payloads = vec![vec![0u8; 100], vec![0u8; 100]];
        let err = encode_batch(&payloads, 150).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_empty_batch() {
        let err = encode_batch(&[], 1024).expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_truncated_body() {
        let body = encode_batch(&[vec![1, 2, 3]], 64).expect("fits");
        let err = decode_batch(&body[..body.len() - 1]).expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::Codec);
    }
}
