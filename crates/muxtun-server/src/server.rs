//! Tunnel server: accept loop and server-side message handling

use crate::config::ServerConfig;
use crate::pool::AddressPool;
use crate::relay;
use async_trait::async_trait;
use muxtun_core::{
    Connection, LogDelegate, PacketReader, PacketWriter, RoleHandler, Tunnel, TunnelResult,
    TunnelSet,
};
use muxtun_proto::{AppFlowKind, Command, FlowId, Message, ResultCode, TunnelKind};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Opens the host-side packet interface backing one IP flow.
///
/// The engine stays decoupled from any concrete packet device; embedders
/// provide whatever reaches their IP stack (a tun device, a test channel).
#[async_trait]
pub trait PacketFlowFactory: Send + Sync + 'static {
    async fn open(
        &self,
        address: Ipv4Addr,
    ) -> io::Result<(Box<dyn PacketReader>, Box<dyn PacketWriter>)>;
}

/// The server side of the tunnel protocol.
pub struct TunnelServer {
    config: ServerConfig,
    pool: Option<Arc<AddressPool>>,
    tunnels: Arc<TunnelSet>,
    packet_flows: Option<Arc<dyn PacketFlowFactory>>,
}

impl TunnelServer {
    /// Build a server from its configuration. A configured pool range is
    /// validated here; a bad range is fatal.
    pub fn new(config: ServerConfig) -> TunnelResult<TunnelServer> {
        let pool = match config.ipv4.as_ref().and_then(|ipv4| ipv4.pool.as_ref()) {
            Some(range) => {
                let (start, end) = range.parse()?;
                Some(Arc::new(AddressPool::new(start, end)?))
            }
            None => None,
        };
        Ok(TunnelServer {
            config,
            pool,
            tunnels: TunnelSet::new(),
            packet_flows: None,
        })
    }

    /// Install the packet interface used by IP flows.
    pub fn with_packet_flows(mut self, factory: Arc<dyn PacketFlowFactory>) -> TunnelServer {
        self.packet_flows = Some(factory);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> Option<&Arc<AddressPool>> {
        self.pool.as_ref()
    }

    /// The live-tunnel set, for coordinated shutdown.
    pub fn tunnel_set(&self) -> Arc<TunnelSet> {
        self.tunnels.clone()
    }

    /// Accept tunnel connections forever.
    pub async fn run(self, listener: TcpListener) -> TunnelResult<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "tunnel server listening");

        let server = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!(%peer_addr, "accepted tunnel connection");
                    server.clone().serve(socket);
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Bring up one tunnel over an accepted socket.
    pub fn serve(self: Arc<Self>, socket: TcpStream) -> Tunnel {
        let tunnels = self.tunnels.clone();
        Tunnel::start(
            Arc::new(socket),
            Arc::new(ServerRole { server: self }),
            Arc::new(LogDelegate),
            &tunnels,
        )
    }
}

/// Server half of the protocol asymmetry: answers `open` by spawning the
/// matching relay, and `fetchConfiguration` with the pool-stripped settings.
struct ServerRole {
    server: Arc<TunnelServer>,
}

#[async_trait]
impl RoleHandler for ServerRole {
    async fn handle_message(
        &self,
        tunnel: &Tunnel,
        command: Command,
        msg: &Message,
        _connection: Option<Arc<Connection>>,
    ) {
        match command {
            Command::Open => self.handle_open(tunnel, msg),
            Command::FetchConfiguration => {
                debug!(tunnel = tunnel.id(), "configuration requested");
                tunnel.write_message(&Message::configuration_response(
                    self.server.config.client_view(),
                ));
            }
            Command::Dns => {
                debug!(tunnel = tunnel.id(), "dns sub-protocol not implemented");
            }
            other => {
                debug!(tunnel = tunnel.id(), command = ?other, "unhandled message");
            }
        }
    }
}

impl ServerRole {
    fn handle_open(&self, tunnel: &Tunnel, msg: &Message) {
        let Some(id) = msg.identifier() else {
            warn!(tunnel = tunnel.id(), "dropping open without identifier");
            return;
        };

        match msg.tunnel_kind() {
            Some(TunnelKind::AppLayer) => match msg.app_flow_kind() {
                Some(AppFlowKind::Tcp) => match (msg.host(), msg.port()) {
                    (Some(host), Some(port)) => {
                        self.spawn_tcp(tunnel, id, host.to_string(), port);
                    }
                    _ => {
                        warn!(id, "tcp open missing target endpoint");
                        tunnel.write_message(&Message::open_result_message(
                            id,
                            ResultCode::InvalidParameter,
                        ));
                    }
                },
                Some(AppFlowKind::Udp) => self.spawn_udp(tunnel, id),
                None => {
                    warn!(id, "open with unrecognized flow type");
                    tunnel.write_message(&Message::open_result_message(
                        id,
                        ResultCode::InvalidParameter,
                    ));
                }
            },
            Some(TunnelKind::IpLayer) => self.spawn_ip(tunnel, id),
            None => {
                warn!(id, "open with missing or unrecognized tunnel type");
                tunnel.write_message(&Message::open_result_message(
                    id,
                    ResultCode::InvalidParameter,
                ));
            }
        }
    }

    fn spawn_tcp(&self, tunnel: &Tunnel, id: FlowId, host: String, port: u16) {
        match tunnel.attach_connection(id, false) {
            Ok((conn, events)) => {
                tokio::spawn(relay::tcp::run(tunnel.clone(), conn, events, host, port));
            }
            Err(e) => {
                warn!(id, error = %e, "cannot attach tcp flow");
                tunnel.write_message(&Message::open_result_message(
                    id,
                    ResultCode::InvalidParameter,
                ));
            }
        }
    }

    fn spawn_udp(&self, tunnel: &Tunnel, id: FlowId) {
        match tunnel.attach_connection(id, false) {
            Ok((conn, events)) => {
                tokio::spawn(relay::udp::run(tunnel.clone(), conn, events));
            }
            Err(e) => {
                warn!(id, error = %e, "cannot attach udp flow");
                tunnel.write_message(&Message::open_result_message(
                    id,
                    ResultCode::InvalidParameter,
                ));
            }
        }
    }

    fn spawn_ip(&self, tunnel: &Tunnel, id: FlowId) {
        match tunnel.attach_connection(id, false) {
            Ok((conn, events)) => {
                tokio::spawn(relay::ip::run(
                    tunnel.clone(),
                    conn,
                    events,
                    self.server.pool.clone(),
                    self.server.packet_flows.clone(),
                    self.server.config.clone(),
                ));
            }
            Err(e) => {
                warn!(id, error = %e, "cannot attach ip flow");
                tunnel.write_message(&Message::open_result_message(
                    id,
                    ResultCode::InvalidParameter,
                ));
            }
        }
    }
}
