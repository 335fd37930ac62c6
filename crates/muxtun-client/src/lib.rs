//! Tunnel Client
//!
//! The client side of the tunnel protocol: opens flows over an established
//! tunnel, exposes byte-stream and datagram handles for app-layer flows,
//! and pumps a platform packet-flow source through an IP-layer flow.

pub mod flow;
pub mod tunnel;

pub use flow::{Flow, FlowData, IpFlow};
pub use tunnel::ClientTunnel;
