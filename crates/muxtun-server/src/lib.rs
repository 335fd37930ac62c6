//! Tunnel Server
//!
//! Accepts tunnel connections over TCP and serves the three flow relays:
//! TCP streams, UDP datagrams, and raw IP packets with virtual address
//! assignment from a configured pool.

pub mod config;
pub mod pool;
mod relay;
pub mod server;

pub use config::{DnsSettings, Ipv4Settings, PoolRange, RouteEntry, ServerConfig};
pub use pool::AddressPool;
pub use server::{PacketFlowFactory, TunnelServer};
