//! Frame codec: length-prefixed message dictionaries
//!
//! Wire format: `[length: u32 little-endian][payload: length - 4 bytes]`,
//! where `length` counts itself. The payload is the bincode serialization of
//! the message dictionary.

use crate::message::Message;
use crate::{FRAME_HEADER_LEN, MAX_FRAME_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame-level errors. Any of these is fatal to the tunnel that produced it.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("frame length {0} below header size")]
    FrameTooShort(usize),

    #[error("truncated frame")]
    Truncated,

    #[error("message has no command")]
    MissingCommand,

    #[error("unknown command: {0}")]
    UnknownCommand(i64),
}

/// Stateless message codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a message into one complete frame.
    pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;
        let frame_len = FRAME_HEADER_LEN + payload.len();
        if frame_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(frame_len));
        }

        let mut buf = BytesMut::with_capacity(frame_len);
        buf.put_u32_le(frame_len as u32);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Validate a length header, returning the total frame length.
    pub fn frame_len(header: [u8; 4]) -> Result<usize, CodecError> {
        let frame_len = u32::from_le_bytes(header) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(frame_len));
        }
        if frame_len < FRAME_HEADER_LEN {
            return Err(CodecError::FrameTooShort(frame_len));
        }
        Ok(frame_len)
    }

    /// Deserialize the payload of one frame (the bytes after the header).
    pub fn decode_payload(payload: &[u8]) -> Result<Message, CodecError> {
        let msg: Message = bincode::deserialize(payload)?;
        let raw = msg.raw_command().ok_or(CodecError::MissingCommand)?;
        if msg.command().is_none() {
            return Err(CodecError::UnknownCommand(raw));
        }
        Ok(msg)
    }

    /// Incremental decode from a growing buffer.
    ///
    /// Returns `Ok(Some(message))` when a complete frame was consumed,
    /// `Ok(None)` when more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        let frame_len = Self::frame_len(header)?;

        if buf.len() < frame_len {
            return Ok(None);
        }

        let _ = buf.split_to(FRAME_HEADER_LEN);
        let payload = buf.split_to(frame_len - FRAME_HEADER_LEN);
        Self::decode_payload(&payload).map(Some)
    }
}
