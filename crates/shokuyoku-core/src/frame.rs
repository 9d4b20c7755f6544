//! Binary frame codec.
//!
//! Every stream message is a frame carrying an event type and an opaque
//! payload:
//!
//! ```text
//! +---------------+------------------+-----------------+---------------+
//! | u32 event_len | event_len bytes  | u32 payload_len | payload bytes |
//! +---------------+------------------+-----------------+---------------+
//! ```
//!
//! Length fields use the process-wide [`ByteOrder`]. Decoding is
//! all-or-nothing: any length that runs past the buffer, and any bytes left
//! over after the payload, reject the whole frame.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const LEN_FIELD: usize = 4;

/// Byte order of the frame length fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Network order (default)
    #[default]
    Big,
    /// Little-endian
    Little,
}

impl FromStr for ByteOrder {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "big" => Ok(ByteOrder::Big),
            "little" => Ok(ByteOrder::Little),
            other => Err(crate::Error::Config(format!(
                "unknown byte order {:?}, expected \"big\" or \"little\"",
                other
            ))),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Event type identifier, used for routing
    pub event_type: String,
    /// Inner payload, expected to be JSON
    pub payload: Bytes,
}

/// Split raw message bytes into event type and payload.
pub fn decode(raw: &[u8], order: ByteOrder) -> Result<Frame, FrameError> {
    let mut buf = raw;

    let event_len = read_len(&mut buf, raw.len(), order)?;
    let event_bytes = take(&mut buf, event_len, "event")?;
    if event_bytes.is_empty() {
        return Err(FrameError::EmptyEventType);
    }
    let event_type = std::str::from_utf8(event_bytes)
        .map_err(|_| FrameError::InvalidEventType)?
        .to_string();

    let payload_len = read_len(&mut buf, raw.len(), order)?;
    let payload = take(&mut buf, payload_len, "payload")?;

    if buf.has_remaining() {
        return Err(FrameError::TrailingBytes(buf.remaining()));
    }

    Ok(Frame {
        event_type,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Build a frame from an event type and payload.
pub fn encode(event_type: &str, payload: &[u8], order: ByteOrder) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 * LEN_FIELD + event_type.len() + payload.len());
    put_len(&mut buf, event_type.len(), order);
    buf.put_slice(event_type.as_bytes());
    put_len(&mut buf, payload.len(), order);
    buf.put_slice(payload);
    buf.freeze()
}

fn read_len(buf: &mut &[u8], total: usize, order: ByteOrder) -> Result<usize, FrameError> {
    if buf.remaining() < LEN_FIELD {
        return Err(FrameError::TruncatedLength {
            offset: total - buf.remaining(),
            available: buf.remaining(),
        });
    }
    let len = match order {
        ByteOrder::Big => buf.get_u32(),
        ByteOrder::Little => buf.get_u32_le(),
    };
    Ok(len as usize)
}

fn take<'a>(
    buf: &mut &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], FrameError> {
    if len > buf.len() {
        return Err(FrameError::LengthOverrun {
            field,
            declared: len,
            available: buf.len(),
        });
    }
    let slice: &'a [u8] = *buf;
    let (head, tail) = slice.split_at(len);
    *buf = tail;
    Ok(head)
}

fn put_len(buf: &mut BytesMut, len: usize, order: ByteOrder) {
    // Lengths beyond u32 cannot be represented; callers never build such frames.
    let len = len as u32;
    match order {
        ByteOrder::Big => buf.put_u32(len),
        ByteOrder::Little => buf.put_u32_le(len),
    }
}
