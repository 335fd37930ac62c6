//! Raw IP packet relay
//!
//! Leases a virtual address from the pool, opens the host-side packet
//! interface for it, and answers success with the per-flow network settings
//! so the client can configure itself. Packet batches are re-chunked to the
//! wire limits in both directions. The lease returns to the pool when the
//! flow ends.

use crate::config::ServerConfig;
use crate::pool::AddressPool;
use crate::server::PacketFlowFactory;
use muxtun_core::{batch_packets, Connection, FlowEvent, Tunnel};
use muxtun_proto::{CloseDirection, Message, ResultCode};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

pub(crate) async fn run(
    tunnel: Tunnel,
    conn: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
    pool: Option<Arc<AddressPool>>,
    factory: Option<Arc<dyn PacketFlowFactory>>,
    config: ServerConfig,
) {
    let id = conn.id();

    let Some(pool) = pool else {
        warn!(id, "ip flow rejected: no address pool configured");
        tunnel.write_message(&Message::open_result_message(id, ResultCode::InternalError));
        conn.abort();
        return;
    };
    let Some(factory) = factory else {
        warn!(id, "ip flow rejected: no packet interface configured");
        tunnel.write_message(&Message::open_result_message(id, ResultCode::InternalError));
        conn.abort();
        return;
    };
    let Some(address) = pool.allocate() else {
        warn!(id, "ip flow rejected: address pool exhausted");
        tunnel.write_message(&Message::open_result_message(id, ResultCode::InternalError));
        conn.abort();
        return;
    };

    let (mut reader, mut writer) = match factory.open(address).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(id, address = %address, error = %e, "packet interface open failed");
            pool.deallocate(address);
            tunnel.write_message(&Message::open_result_message(id, ResultCode::InternalError));
            conn.abort();
            return;
        }
    };

    info!(id, address = %address, "ip flow assigned address");
    tunnel.write_message(&Message::open_result_with_settings(
        id,
        ResultCode::Success,
        config.flow_view(address),
    ));

    let mut suspended = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(FlowEvent::Packets { packets, protocols }) => {
                    if let Err(e) = writer.write_packets(&packets, &protocols).await {
                        warn!(id, error = %e, "host packet write failed");
                        conn.close(CloseDirection::All);
                        break;
                    }
                }
                Some(FlowEvent::Suspend) => suspended = true,
                Some(FlowEvent::Resume) => suspended = false,
                Some(FlowEvent::Close(_)) => {
                    conn.close_connection(CloseDirection::All);
                    break;
                }
                Some(FlowEvent::Data(_))
                | Some(FlowEvent::Datagram { .. })
                | Some(FlowEvent::OpenResult { .. }) => {
                    warn!(id, "unexpected event for ip flow");
                }
                None => break,
            },

            result = reader.read_packets(), if !suspended => match result {
                Ok((packets, protocols)) => {
                    for (packets, protocols) in batch_packets(packets, protocols) {
                        tunnel.write_message(&Message::packets_message(id, &packets, &protocols));
                    }
                }
                Err(e) => {
                    debug!(id, error = %e, "host packet source ended");
                    conn.close(CloseDirection::All);
                    break;
                }
            },
        }
    }

    debug!(id, address = %address, "returning address to pool");
    pool.deallocate(address);
}
