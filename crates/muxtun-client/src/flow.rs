//! Client-side flow handles

use bytes::Bytes;
use muxtun_core::{batch_packets, Connection, FlowEvent, PacketReader, PacketWriter, Tunnel};
use muxtun_core::{TunnelError, TunnelResult};
use muxtun_proto::{CloseDirection, ConfigMap, FlowId, Message, ResultCode};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Payload received on an app-layer flow.
#[derive(Debug)]
pub enum FlowData {
    /// Bytes on a TCP flow
    Stream(Bytes),
    /// A datagram with the UDP peer it came from
    Datagram {
        data: Bytes,
        host: String,
        port: u16,
    },
}

/// Handle to an app-layer flow (TCP or UDP).
pub struct Flow {
    conn: Arc<Connection>,
    events: UnboundedReceiver<FlowEvent>,
    settings: Option<ConfigMap>,
}

impl Flow {
    pub(crate) fn new(conn: Arc<Connection>, events: UnboundedReceiver<FlowEvent>) -> Flow {
        Flow {
            conn,
            events,
            settings: None,
        }
    }

    pub fn id(&self) -> FlowId {
        self.conn.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Whether the peer has asked this flow to pause.
    pub fn is_suspended(&self) -> bool {
        self.conn.is_suspended()
    }

    /// Network settings attached to the open result, if any.
    pub fn settings(&self) -> Option<&ConfigMap> {
        self.settings.as_ref()
    }

    /// Wait for the server's answer to our open request.
    pub async fn opened(&mut self) -> TunnelResult<ResultCode> {
        loop {
            match self.events.recv().await {
                Some(FlowEvent::OpenResult { code, settings }) => {
                    self.settings = settings;
                    return Ok(code);
                }
                Some(FlowEvent::Close(CloseDirection::All)) | None => {
                    return Err(TunnelError::BadConnection(
                        "flow closed before open completed".into(),
                    ));
                }
                Some(_) => {}
            }
        }
    }

    /// Next payload; `None` once the flow is fully closed.
    pub async fn recv(&mut self) -> Option<FlowData> {
        loop {
            match self.events.recv().await? {
                FlowEvent::Data(data) => return Some(FlowData::Stream(data)),
                FlowEvent::Datagram { data, host, port } => {
                    return Some(FlowData::Datagram { data, host, port })
                }
                FlowEvent::Close(CloseDirection::All) => return None,
                FlowEvent::OpenResult { settings, .. } => {
                    self.settings = settings;
                }
                _ => {}
            }
        }
    }

    /// Send bytes down a TCP flow.
    pub fn write(&self, data: &[u8]) -> bool {
        match self.conn.tunnel() {
            Some(tunnel) => tunnel.write_message(&Message::data_message(self.id(), data)),
            None => false,
        }
    }

    /// Send a datagram to `host:port` through a UDP flow.
    pub fn write_to(&self, data: &[u8], host: &str, port: u16) -> bool {
        match self.conn.tunnel() {
            Some(tunnel) => {
                tunnel.write_message(&Message::datagram_message(self.id(), data, host, port))
            }
            None => false,
        }
    }

    /// Half- or fully close the flow, telling the peer.
    pub fn close(&self, direction: CloseDirection) {
        self.conn.close(direction);
    }

    /// Tear the flow down locally without telling the peer.
    pub fn abort(&self) {
        self.conn.abort();
    }
}

/// Handle to an IP-layer flow whose packet pump runs on its own task.
pub struct IpFlow {
    conn: Arc<Connection>,
    ready: Option<oneshot::Receiver<(ResultCode, Option<ConfigMap>)>>,
}

impl IpFlow {
    pub(crate) fn new(
        conn: Arc<Connection>,
        ready: oneshot::Receiver<(ResultCode, Option<ConfigMap>)>,
    ) -> IpFlow {
        IpFlow {
            conn,
            ready: Some(ready),
        }
    }

    pub fn id(&self) -> FlowId {
        self.conn.id()
    }

    /// Wait for the open result and the per-flow settings carrying the
    /// assigned address. Resolves once.
    pub async fn opened(&mut self) -> TunnelResult<(ResultCode, Option<ConfigMap>)> {
        let Some(ready) = self.ready.take() else {
            return Err(TunnelError::BadConnection("open result already taken".into()));
        };
        ready.await.map_err(|_| {
            TunnelError::BadConnection("flow closed before open completed".into())
        })
    }

    pub fn close(&self) {
        self.conn.close(CloseDirection::All);
    }
}

/// Bridge one IP flow between the tunnel and a packet-flow pair.
pub(crate) async fn pump_ip_flow(
    tunnel: Tunnel,
    conn: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
    mut reader: Box<dyn PacketReader>,
    mut writer: Box<dyn PacketWriter>,
    ready: oneshot::Sender<(ResultCode, Option<ConfigMap>)>,
) {
    let id = conn.id();

    let (code, settings) = loop {
        match events.recv().await {
            Some(FlowEvent::OpenResult { code, settings }) => break (code, settings),
            Some(FlowEvent::Close(CloseDirection::All)) | None => {
                debug!(id, "ip flow closed before open completed");
                return;
            }
            Some(_) => {}
        }
    };
    let _ = ready.send((code, settings));
    if code != ResultCode::Success {
        debug!(id, code = ?code, "ip flow open failed");
        conn.abort();
        return;
    }

    let mut suspended = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(FlowEvent::Packets { packets, protocols }) => {
                    if let Err(e) = writer.write_packets(&packets, &protocols).await {
                        warn!(id, error = %e, "packet sink failed");
                        conn.close(CloseDirection::All);
                        break;
                    }
                }
                Some(FlowEvent::Suspend) => suspended = true,
                Some(FlowEvent::Resume) => suspended = false,
                Some(FlowEvent::Close(CloseDirection::All)) => break,
                Some(FlowEvent::Close(_)) => {}
                Some(_) => warn!(id, "unexpected event for ip flow"),
                None => break,
            },

            result = reader.read_packets(), if !suspended => match result {
                Ok((packets, protocols)) => {
                    for (packets, protocols) in batch_packets(packets, protocols) {
                        tunnel.write_message(&Message::packets_message(id, &packets, &protocols));
                    }
                }
                Err(e) => {
                    debug!(id, error = %e, "packet source ended");
                    conn.close(CloseDirection::All);
                    break;
                }
            },
        }
    }
}
