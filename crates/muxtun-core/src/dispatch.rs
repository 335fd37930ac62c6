//! Dispatch core: routes decoded messages to flows or to the role handler

use crate::connection::Connection;
use crate::tunnel::Tunnel;
use async_trait::async_trait;
use muxtun_proto::{Command, Message};
use std::sync::Arc;
use tracing::{error, warn};

/// The single point of asymmetry between the two endpoints.
///
/// The client's handler recognizes `openResult` and `fetchConfiguration`
/// responses; the server's handler recognizes `open` and
/// `fetchConfiguration` requests.
#[async_trait]
pub trait RoleHandler: Send + Sync + 'static {
    /// Handle a message the dispatch core did not consume.
    ///
    /// `connection` is the resolved flow for commands that carry a known
    /// identifier; `open` and `dns` are always passed unresolved.
    async fn handle_message(
        &self,
        tunnel: &Tunnel,
        command: Command,
        msg: &Message,
        connection: Option<Arc<Connection>>,
    );
}

/// Route one decoded message.
pub(crate) async fn dispatch_message(tunnel: &Tunnel, msg: Message) {
    let Some(command) = msg.command() else {
        // Unreachable behind the codec, which rejects such frames.
        error!(tunnel = tunnel.id(), "discarding message without a valid command");
        return;
    };

    // open and dns never resolve a connection.
    if matches!(command, Command::Open | Command::Dns) {
        tunnel.role().handle_message(tunnel, command, &msg, None).await;
        return;
    }

    let connection = msg.identifier().and_then(|id| tunnel.connection(id));
    let Some(conn) = connection else {
        tunnel.role().handle_message(tunnel, command, &msg, None).await;
        return;
    };

    match command {
        Command::Data => {
            let Some(data) = msg.data() else {
                warn!(id = conn.id(), "dropping data message without payload");
                return;
            };
            match (msg.host(), msg.port()) {
                (Some(host), Some(port)) => conn.deliver_datagram(data, host.to_string(), port),
                _ => conn.deliver_data(data),
            }
        }
        Command::Suspend => conn.suspend(),
        Command::Resume => conn.resume(),
        Command::Close => conn.close_connection(msg.close_type()),
        Command::Packets => match (msg.packets(), msg.protocols()) {
            (Some(packets), Some(protocols)) if packets.len() == protocols.len() => {
                conn.deliver_packets(packets, protocols.to_vec());
            }
            _ => {
                warn!(
                    id = conn.id(),
                    "dropping packets message with mismatched batch"
                );
            }
        },
        other => {
            tunnel
                .role()
                .handle_message(tunnel, other, &msg, Some(conn))
                .await;
        }
    }
}
