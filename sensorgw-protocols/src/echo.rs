//! ## sensorgw-protocols::echo
//! Generic length-prefixed frames: `[u16 BE length][payload]`.
//!
//! Used by the echo connection mode (payload returned to the peer) and by the
//! discard mode (payload dropped, only the frame boundary matters).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload accepted by the echo mode.
pub const MAX_ECHO_FRAME: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EchoFrameError {
    #[error("Zero-length frame")]
    Empty,
    #[error("Frame length {len} exceeds maximum {max}")]
    TooLong { len: usize, max: usize },
}

fn declared_len(buf: &[u8]) -> Option<usize> {
    (buf.len() >= 2).then(|| usize::from(u16::from_be_bytes([buf[0], buf[1]])))
}

/// Takes one complete frame off the front of `buf` and returns its payload.
///
/// The declared length is validated as soon as the header is buffered, so a
/// hostile length is rejected without waiting for its payload.
pub fn next_frame(buf: &mut BytesMut, max: usize) -> Result<Option<Bytes>, EchoFrameError> {
    let Some(len) = declared_len(buf) else {
        return Ok(None);
    };
    if len == 0 {
        return Err(EchoFrameError::Empty);
    }
    if len > max {
        return Err(EchoFrameError::TooLong { len, max });
    }
    if buf.len() < 2 + len {
        return Ok(None);
    }

    buf.advance(2);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Drops one complete frame of any length. Returns the dropped payload length.
pub fn skip_frame(buf: &mut BytesMut) -> Option<usize> {
    let len = declared_len(buf)?;
    if buf.len() < 2 + len {
        return None;
    }
    buf.advance(2 + len);
    Some(len)
}

/// Appends `payload` with its length prefix. Payloads longer than `u16::MAX`
/// are truncated to the representable length.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    let len = payload.len().min(usize::from(u16::MAX));
    dst.reserve(2 + len);
    dst.put_u16(len as u16);
    dst.put_slice(&payload[..len]);
}
