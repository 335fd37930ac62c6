//! Tunnel Wire Protocol
//!
//! This crate defines the wire-level vocabulary of the tunnel: the
//! polymorphic value model, the message dictionary with its typed accessors,
//! and the length-prefixed frame codec shared by both endpoints.

pub mod codec;
pub mod message;
pub mod value;

pub use codec::{CodecError, FrameCodec};
pub use message::{
    AppFlowKind, CloseDirection, Command, ConfigMap, FlowId, Message, ResultCode, TunnelKind,
};
pub use value::Value;

/// Maximum permitted frame length, inclusive of the 4-byte header (128 KiB)
pub const MAX_FRAME_LEN: usize = 128 * 1024;

/// Size of the little-endian length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest raw IP packet carried in a `packets` message
pub const MAX_PACKET_BYTES: usize = 8192;

/// Largest number of raw IP packets batched into one `packets` message
pub const MAX_PACKETS_PER_MESSAGE: usize = 32;
