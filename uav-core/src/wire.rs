//! Wire encoding: pluggable codec + length-prefix framing (4 bytes LE).

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
/// Protocol messages are a handful of 32-byte fields; anything larger is rejected.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// Turns a message into bytes and back. Protocol code never depends on the concrete encoding.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, FrameDecodeError>;
}

/// Compact binary encoding (bincode). The canonical codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
        Ok(bincode::serialize(msg)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, FrameDecodeError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Textual encoding (JSON object, byte values as hex).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, FrameDecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode a message into a single frame: 4 bytes LE length + codec payload.
pub fn encode_frame(codec: &dyn Codec, msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = codec.encode(msg)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("bincode encode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Length announced by a frame header, or `None` if fewer than 4 bytes are available.
pub fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < LEN_SIZE {
        return None;
    }
    Some(u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(codec: &dyn Codec, bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = frame_len(bytes).ok_or(FrameDecodeError::NeedMore)?;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = codec.decode(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("bincode decode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
}
