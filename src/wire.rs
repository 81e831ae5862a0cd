//! Length-prefixed, tagged wire framing for sensor-to-manager messages.
//!
//! A message on the wire is a small fixed header (protocol version plus an
//! origination timestamp) followed by one `(tag, length, payload)` record:
//!
//! ```text
//! +---------+----------------------+-----+----------+-----------------+
//! | version |     timestamp (i64)  | tag | len (u32)|     payload     |
//! |  1 byte |  8 bytes, big-endian |  1B |  4 bytes |    `len` bytes   |
//! +---------+----------------------+-----+----------+-----------------+
//! ```
//!
//! This module is pure: it knows nothing about sockets, TLS, or the
//! session state machine above it. Framing errors never panic; they come
//! back as a [`ProtocolError`](crate::error::ProtocolError) for the caller
//! to act on.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::ProtocolError;

/// Protocol version this manager speaks. A sensor announcing a different
/// version in its frame header terminates the session.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames larger than this are rejected outright, before the payload is
/// even read off the wire.
pub const MAX_FRAME_SIZE: usize = 1_048_576;

const HEADER_LEN: usize = 1 + 8;
const TAG_LEN: usize = 1;
const LENGTH_FIELD_LEN: usize = 4;

/// The tag byte identifying a record's payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Alert,
    Heartbeat,
    /// Vendor-specific payload; the first byte of the payload is a
    /// decode-plugin sub-tag, the remainder is plugin-private.
    Proprietary,
    /// Used only during the authentication handshake.
    Auth,
    /// Anything else: logged and skipped by the normalizer, never fatal.
    Unknown(u8),
}

impl Tag {
    fn to_byte(self) -> u8 {
        match self {
            Tag::Alert => 0,
            Tag::Heartbeat => 1,
            Tag::Proprietary => 2,
            Tag::Auth => 3,
            Tag::Unknown(b) => b,
        }
    }

    fn from_byte(b: u8) -> Tag {
        match b {
            0 => Tag::Alert,
            1 => Tag::Heartbeat,
            2 => Tag::Proprietary,
            3 => Tag::Auth,
            other => Tag::Unknown(other),
        }
    }
}

/// A fully-decoded wire message: header plus one tagged record.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub version: u8,
    pub timestamp: DateTime<Utc>,
    pub tag: Tag,
    pub payload: Bytes,
}

/// Encode a record into a complete wire frame, stamping it with the
/// current time and the manager's protocol version.
pub fn encode_message(tag: Tag, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    encode_message_at(tag, payload, Utc::now())
}

/// Same as [`encode_message`] but with an explicit timestamp, so tests
/// don't depend on wall-clock time.
pub fn encode_message_at(
    tag: Tag,
    payload: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + TAG_LEN + LENGTH_FIELD_LEN + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_i64(timestamp.timestamp());
    buf.put_u8(tag.to_byte());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read exactly one wire message from an async stream.
///
/// Returns `Ok(None)` on a clean EOF that lands precisely on a frame
/// boundary (the peer closed the connection between messages); any other
/// truncation is a [`ProtocolError::Truncated`].
pub async fn read_message<R>(io: &mut R) -> Result<Option<WireMessage>, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN + TAG_LEN + LENGTH_FIELD_LEN];
    match read_exact_or_eof(io, &mut header).await? {
        None => return Ok(None),
        Some(()) => {}
    }

    let mut cursor = &header[..];
    let version = cursor.get_u8();
    let ts_secs = cursor.get_i64();
    let tag = Tag::from_byte(cursor.get_u8());
    let len = cursor.get_u32() as usize;

    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload)
        .await
        .map_err(|_| ProtocolError::Truncated)?;

    let timestamp = Utc.timestamp_opt(ts_secs, 0).single().unwrap_or_else(Utc::now);

    Ok(Some(WireMessage {
        version,
        timestamp,
        tag,
        payload: Bytes::from(payload),
    }))
}

/// Write a wire message and flush it.
pub async fn write_message<W>(io: &mut W, tag: Tag, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = encode_message(tag, payload)?;
    io.write_all(&frame)
        .await
        .map_err(|_| ProtocolError::Truncated)?;
    io.flush().await.map_err(|_| ProtocolError::Truncated)?;
    Ok(())
}

/// `read_exact`, but EOF on the very first byte is reported as a clean
/// end-of-stream (`Ok(None)`) rather than an error.
async fn read_exact_or_eof<R>(io: &mut R, buf: &mut [u8]) -> Result<Option<()>, ProtocolError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = io
            .read(&mut buf[filled..])
            .await
            .map_err(|_| ProtocolError::Truncated)?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
        filled += n;
    }
    Ok(Some(()))
}

/// AUTH record payload: a one-byte result code and the manager's 64-bit
/// analyzer id in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Succeed,
    Failed,
}

pub fn encode_auth_payload(result: AuthResult, manager_analyzer_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 8);
    buf.put_u8(match result {
        AuthResult::Succeed => 0,
        AuthResult::Failed => 1,
    });
    buf.put_u64(manager_analyzer_id);
    buf.freeze()
}

pub fn decode_auth_payload(payload: &[u8]) -> Result<(AuthResult, u64), ProtocolError> {
    if payload.len() != 9 {
        return Err(ProtocolError::Malformed(format!(
            "AUTH payload must be 9 bytes, got {}",
            payload.len()
        )));
    }
    let result = match payload[0] {
        0 => AuthResult::Succeed,
        1 => AuthResult::Failed,
        other => return Err(ProtocolError::Malformed(format!("bad AUTH result code {other}"))),
    };
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&payload[1..9]);
    Ok((result, u64::from_be_bytes(id_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_record() {
        let (mut a, mut b) = duplex(4096);
        let ts = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        write_message(&mut a, Tag::Alert, b"hello").await.unwrap();
        drop(a);

        let msg = read_message(&mut b).await.unwrap().expect("one message");
        assert_eq!(msg.version, PROTOCOL_VERSION);
        assert_eq!(msg.tag, Tag::Alert);
        assert_eq!(&msg.payload[..], b"hello");
        // sanity on the timestamp encoding, not the exact clock value
        assert!(msg.timestamp.timestamp() > ts.timestamp() - 10);
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_not_an_error() {
        let (a, mut b) = duplex(16);
        drop(a);
        let result = read_message(&mut b).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = duplex(4096);
        a.write_all(&[PROTOCOL_VERSION]).await.unwrap();
        drop(a);
        let result = read_message(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::Truncated)));
    }

    #[test]
    fn rejects_oversized_frame_before_reading_payload() {
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = encode_message(Tag::Alert, &huge).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn auth_payload_round_trips() {
        let payload = encode_auth_payload(AuthResult::Succeed, 0xAABBCCDD_u64);
        let (result, id) = decode_auth_payload(&payload).unwrap();
        assert_eq!(result, AuthResult::Succeed);
        assert_eq!(id, 0xAABBCCDD_u64);
    }

    #[test]
    fn unknown_tag_round_trips_for_logging() {
        assert_eq!(Tag::from_byte(200), Tag::Unknown(200));
    }
}
