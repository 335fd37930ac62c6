//! Logical connections multiplexed over a tunnel

use crate::tunnel::{Tunnel, TunnelInner};
use bytes::Bytes;
use muxtun_proto::{CloseDirection, ConfigMap, FlowId, Message, ResultCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

/// Events delivered to the task that owns a flow.
///
/// Events for one connection arrive in the order the peer framed them.
#[derive(Debug)]
pub enum FlowEvent {
    /// Stream payload for an app-layer flow
    Data(Bytes),
    /// Datagram payload with its UDP peer endpoint
    Datagram {
        data: Bytes,
        host: String,
        port: u16,
    },
    /// Raw IP packet batch; `packets` and `protocols` have equal length
    Packets {
        packets: Vec<Bytes>,
        protocols: Vec<i64>,
    },
    /// Stop reading from the flow's external source
    Suspend,
    /// Resume reading from the flow's external source
    Resume,
    /// The close state advanced; carries the state after the transition
    Close(CloseDirection),
    /// The peer answered our open request
    OpenResult {
        code: ResultCode,
        settings: Option<ConfigMap>,
    },
}

/// One logical flow inside a tunnel.
///
/// Owned by the tunnel registry; the task serving the flow holds the event
/// receiver. The back-reference to the tunnel is weak and is cleared when
/// the connection leaves the registry.
pub struct Connection {
    id: FlowId,
    exclusive: bool,
    tunnel: Mutex<Weak<TunnelInner>>,
    events: UnboundedSender<FlowEvent>,
    close_state: Mutex<CloseDirection>,
    suspended: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        id: FlowId,
        exclusive: bool,
        tunnel: Weak<TunnelInner>,
    ) -> (Arc<Self>, UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection {
            id,
            exclusive,
            tunnel: Mutex::new(tunnel),
            events: tx,
            close_state: Mutex::new(CloseDirection::None),
            suspended: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    /// An exclusive connection closes its tunnel when it fully closes.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// The owning tunnel; `None` once the connection has been removed.
    pub fn tunnel(&self) -> Option<Tunnel> {
        self.tunnel
            .lock()
            .unwrap()
            .upgrade()
            .map(Tunnel::from_inner)
    }

    pub fn close_direction(&self) -> CloseDirection {
        *self.close_state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.close_direction() == CloseDirection::All
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    // ---- inbound delivery (dispatch core) ----

    pub fn deliver_data(&self, data: Bytes) {
        self.send_event(FlowEvent::Data(data));
    }

    pub fn deliver_datagram(&self, data: Bytes, host: String, port: u16) {
        self.send_event(FlowEvent::Datagram { data, host, port });
    }

    pub fn deliver_packets(&self, packets: Vec<Bytes>, protocols: Vec<i64>) {
        self.send_event(FlowEvent::Packets { packets, protocols });
    }

    pub fn deliver_open_result(&self, code: ResultCode, settings: Option<ConfigMap>) {
        self.send_event(FlowEvent::OpenResult { code, settings });
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        self.send_event(FlowEvent::Suspend);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
        self.send_event(FlowEvent::Resume);
    }

    fn send_event(&self, event: FlowEvent) {
        if self.events.send(event).is_err() {
            trace!(id = self.id, "flow task gone, event dropped");
        }
    }

    // ---- half-close state machine ----

    /// Apply one close request to the half-close state machine.
    ///
    /// On reaching the fully-closed state the connection leaves the tunnel
    /// registry exactly once, or closes the tunnel when exclusive. No close
    /// message is sent to the peer.
    pub fn close_connection(&self, direction: CloseDirection) {
        if direction == CloseDirection::None {
            return;
        }

        let owner = self.tunnel.lock().unwrap().upgrade();
        let (previous, current) = {
            let mut state = self.close_state.lock().unwrap();
            let previous = *state;
            *state = previous.apply(direction);
            (previous, *state)
        };
        if current == previous {
            return;
        }

        debug!(id = self.id, from = ?previous, to = ?current, "flow close state advanced");
        if current == CloseDirection::All {
            *self.tunnel.lock().unwrap() = Weak::new();
            if let Some(inner) = owner {
                let tunnel = Tunnel::from_inner(inner);
                let removed = tunnel.remove_connection(self.id);
                if removed && self.exclusive {
                    tunnel.close();
                }
            }
        }
        self.send_event(FlowEvent::Close(current));
    }

    /// Send a close message for `direction` to the peer, then apply it
    /// locally.
    pub fn close(&self, direction: CloseDirection) {
        if direction == CloseDirection::None {
            return;
        }
        if let Some(tunnel) = self.tunnel() {
            tunnel.write_message(&Message::close_message(self.id, direction));
        }
        self.close_connection(direction);
    }

    /// Tear the connection down locally without telling the peer.
    ///
    /// Pending output for the flow is abandoned. Idempotent.
    pub fn abort(&self) {
        self.close_connection(CloseDirection::All);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("exclusive", &self.exclusive)
            .field("close_state", &self.close_direction())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}
