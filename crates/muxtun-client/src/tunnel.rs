//! Client tunnel: connection establishment and flow opening

use crate::flow::{self, Flow, IpFlow};
use async_trait::async_trait;
use muxtun_core::{
    Connection, PacketReader, PacketWriter, RoleHandler, Tunnel, TunnelDelegate, TunnelError,
    TunnelIo, TunnelResult, TunnelSet,
};
use muxtun_proto::{Command, FlowId, Message, ResultCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// The client endpoint of one tunnel.
///
/// Flow identifiers are assigned locally from a per-tunnel counter; the
/// server echoes them back on every message addressed to the flow.
pub struct ClientTunnel {
    tunnel: Tunnel,
    next_flow_id: AtomicU32,
}

impl ClientTunnel {
    /// Connect to a `host:port` endpoint over TCP.
    pub async fn connect(
        server: &str,
        delegate: Arc<dyn TunnelDelegate>,
        set: &Arc<TunnelSet>,
    ) -> TunnelResult<ClientTunnel> {
        let (host, port) = split_endpoint(server)?;
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::start(Arc::new(stream), delegate, set))
    }

    /// Bring up the client over any established reliable stream.
    pub fn start(
        io: Arc<dyn TunnelIo>,
        delegate: Arc<dyn TunnelDelegate>,
        set: &Arc<TunnelSet>,
    ) -> ClientTunnel {
        let tunnel = Tunnel::start(io, Arc::new(ClientRole), delegate, set);
        ClientTunnel {
            tunnel,
            next_flow_id: AtomicU32::new(1),
        }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub fn is_closed(&self) -> bool {
        self.tunnel.is_closed()
    }

    pub fn close(&self) {
        self.tunnel.close();
    }

    fn next_id(&self) -> FlowId {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a TCP flow to `host:port` behind the server.
    ///
    /// The returned flow's [`Flow::opened`] resolves with the server's
    /// result code.
    pub fn open_tcp_flow(&self, host: &str, port: u16) -> TunnelResult<Flow> {
        let id = self.next_id();
        let (conn, events) = self.tunnel.attach_connection(id, false)?;
        if !self
            .tunnel
            .write_message(&Message::open_tcp_message(id, host, port))
        {
            conn.abort();
            return Err(TunnelError::Internal("could not send open".into()));
        }
        Ok(Flow::new(conn, events))
    }

    /// Open a UDP flow. Datagrams are addressed per-write with
    /// [`Flow::write_to`].
    pub fn open_udp_flow(&self) -> TunnelResult<Flow> {
        let id = self.next_id();
        let (conn, events) = self.tunnel.attach_connection(id, false)?;
        if !self.tunnel.write_message(&Message::open_udp_message(id)) {
            conn.abort();
            return Err(TunnelError::Internal("could not send open".into()));
        }
        Ok(Flow::new(conn, events))
    }

    /// Open an IP flow and pump `reader`/`writer` through it.
    ///
    /// Outbound packets read from `reader` are batched into the tunnel;
    /// inbound batches are written to `writer`. [`IpFlow::opened`] resolves
    /// with the result code and the per-flow settings carrying the assigned
    /// address.
    pub fn open_ip_flow(
        &self,
        reader: Box<dyn PacketReader>,
        writer: Box<dyn PacketWriter>,
    ) -> TunnelResult<IpFlow> {
        let id = self.next_id();
        let (conn, events) = self.tunnel.attach_connection(id, false)?;
        if !self.tunnel.write_message(&Message::open_ip_message(id)) {
            conn.abort();
            return Err(TunnelError::Internal("could not send open".into()));
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(flow::pump_ip_flow(
            self.tunnel.clone(),
            conn.clone(),
            events,
            reader,
            writer,
            ready_tx,
        ));
        Ok(IpFlow::new(conn, ready_rx))
    }

    /// Ask the server for the tunnel network settings. The response arrives
    /// through the delegate's `configuration_received`.
    pub fn fetch_configuration(&self) -> bool {
        self.tunnel
            .write_message(&Message::fetch_configuration_message())
    }
}

fn split_endpoint(server: &str) -> TunnelResult<(&str, u16)> {
    let (host, port) = server.rsplit_once(':').ok_or_else(|| {
        TunnelError::BadConfiguration(format!("expected host:port, got {server}"))
    })?;
    let port = port
        .parse()
        .map_err(|_| TunnelError::BadConfiguration(format!("bad port in {server}")))?;
    Ok((host, port))
}

/// Client half of the protocol asymmetry: open results complete the flow's
/// open, configuration responses surface through the delegate.
struct ClientRole;

#[async_trait]
impl RoleHandler for ClientRole {
    async fn handle_message(
        &self,
        tunnel: &Tunnel,
        command: Command,
        msg: &Message,
        connection: Option<Arc<Connection>>,
    ) {
        match command {
            Command::OpenResult => match connection {
                Some(conn) => {
                    let code = msg.result_code().unwrap_or(ResultCode::InternalError);
                    conn.deliver_open_result(code, msg.configuration().cloned());
                }
                None => debug!(tunnel = tunnel.id(), "open result for unknown flow"),
            },
            Command::FetchConfiguration => match msg.configuration() {
                Some(settings) => {
                    tunnel.delegate().configuration_received(tunnel, settings);
                }
                None => debug!(tunnel = tunnel.id(), "configuration response without settings"),
            },
            Command::Dns => {
                debug!(tunnel = tunnel.id(), "dns sub-protocol not implemented");
            }
            other => {
                debug!(tunnel = tunnel.id(), command = ?other, "unhandled message");
            }
        }
    }
}
