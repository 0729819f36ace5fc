//! Deterministic encoding used for block payloads and wire/WAL messages.
//!
//! Struct fields are emitted in declaration order, so a given value always
//! encodes to the same bytes. Wire messages are framed as a one byte kind tag
//! followed by a big-endian `u32` length and the payload.
use serde::de::DeserializeOwned;
use serde::Serialize;

const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("message of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a framed message into its tag and payload.
pub fn unframe(bytes: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: FRAME_HEADER_LEN,
            got: bytes.len(),
        });
    }
    let tag = bytes[0];
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let body = &bytes[FRAME_HEADER_LEN..];
    if body.len() < len {
        return Err(CodecError::Truncated {
            needed: len,
            got: body.len(),
        });
    }
    if body.len() > len {
        return Err(CodecError::TrailingBytes(body.len() - len));
    }
    Ok((tag, body))
}
