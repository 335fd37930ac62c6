//! Tunnel Engine
//!
//! The protocol engine shared by both endpoints: the tunnel transport with
//! its framed read loop and outbound save queue, the per-flow connection
//! registry with half-close tracking, and the dispatch core that routes each
//! decoded message to a logical connection or to the role-specific handler.
//!
//! The engine is task-per-flow: one read-loop task per tunnel feeds the
//! dispatch core, one drain task flushes the tunnel save queue, and every
//! logical flow runs its own task that receives [`FlowEvent`]s over a
//! channel. Shared state lives behind plain mutexes that are never held
//! across an await point.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod packet_flow;
pub mod registry;
pub mod tunnel;

pub use connection::{Connection, FlowEvent};
pub use dispatch::RoleHandler;
pub use error::{TunnelError, TunnelResult};
pub use io::{MemoryIo, TunnelIo};
pub use packet_flow::{
    batch_packets, channel_packet_flow, ChannelPacketReader, ChannelPacketWriter, PacketReader,
    PacketWriter,
};
pub use registry::TunnelSet;
pub use tunnel::{LogDelegate, Tunnel, TunnelDelegate};
