//! UDP datagram relay
//!
//! Binds an ephemeral socket up front and answers success immediately.
//! Every outbound `data` event carries its own peer endpoint; every inbound
//! datagram travels back as a `data` message stamped with its source. There
//! is no half-close: any close tears the relay down.

use muxtun_core::{Connection, FlowEvent, Tunnel};
use muxtun_proto::{CloseDirection, Message, ResultCode};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

pub(crate) async fn run(
    tunnel: Tunnel,
    conn: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
) {
    let id = conn.id();
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(id, error = %e, "udp bind failed");
            tunnel.write_message(&Message::open_result_message(id, ResultCode::InternalError));
            conn.abort();
            return;
        }
    };
    debug!(id, "udp flow open");
    tunnel.write_message(&Message::open_result_message(id, ResultCode::Success));

    let mut suspended = false;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(FlowEvent::Datagram { data, host, port }) => {
                    if let Err(e) = socket.send_to(&data, (host.as_str(), port)).await {
                        warn!(id, host = %host, port, error = %e, "udp send failed");
                        conn.close(CloseDirection::All);
                        break;
                    }
                }
                Some(FlowEvent::Data(_)) => {
                    warn!(id, "dropping udp data without a peer endpoint");
                }
                Some(FlowEvent::Suspend) => suspended = true,
                Some(FlowEvent::Resume) => suspended = false,
                Some(FlowEvent::Close(_)) => {
                    // No half-close for datagram flows.
                    conn.close_connection(CloseDirection::All);
                    break;
                }
                Some(FlowEvent::Packets { .. }) | Some(FlowEvent::OpenResult { .. }) => {
                    warn!(id, "unexpected event for udp flow");
                }
                None => break,
            },

            result = socket.recv_from(&mut buf), if !suspended => match result {
                Ok((n, peer)) => {
                    tunnel.write_message(&Message::datagram_message(
                        id,
                        &buf[..n],
                        &peer.ip().to_string(),
                        peer.port(),
                    ));
                }
                Err(e) => {
                    warn!(id, error = %e, "udp receive failed");
                    conn.close(CloseDirection::All);
                    break;
                }
            },
        }
    }
}
