//! Tunnel transport: one framed duplex channel and its flow registry

use crate::connection::{Connection, FlowEvent};
use crate::dispatch::{self, RoleHandler};
use crate::error::{TunnelError, TunnelResult};
use crate::io::{read_exact, TunnelIo};
use crate::registry::TunnelSet;
use bytes::Bytes;
use muxtun_proto::{ConfigMap, FlowId, FrameCodec, Message, FRAME_HEADER_LEN};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Lifecycle events surfaced to the embedder.
pub trait TunnelDelegate: Send + Sync + 'static {
    fn tunnel_opened(&self, _tunnel: &Tunnel) {}
    fn tunnel_closed(&self, _tunnel: &Tunnel) {}
    fn configuration_received(&self, _tunnel: &Tunnel, _settings: &ConfigMap) {}
}

/// Delegate that only logs.
pub struct LogDelegate;

impl TunnelDelegate for LogDelegate {
    fn tunnel_opened(&self, tunnel: &Tunnel) {
        debug!(tunnel = tunnel.id(), "tunnel opened");
    }

    fn tunnel_closed(&self, tunnel: &Tunnel) {
        debug!(tunnel = tunnel.id(), "tunnel closed");
    }
}

struct PendingFrame {
    frame: Bytes,
    written: usize,
}

struct MuxState {
    connections: HashMap<FlowId, Arc<Connection>>,
    save_queue: VecDeque<PendingFrame>,
}

pub(crate) struct TunnelInner {
    id: u64,
    io: Arc<dyn TunnelIo>,
    role: Arc<dyn RoleHandler>,
    delegate: Arc<dyn TunnelDelegate>,
    set: Weak<TunnelSet>,
    state: Mutex<MuxState>,
    write_ready: Notify,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one tunnel. Cheap to clone; all clones refer to the same
/// underlying channel and registry.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl Tunnel {
    /// Bring up a tunnel over `io`: registers it in `set`, notifies the
    /// delegate, and spawns the framed read loop and the save-queue drain
    /// task.
    pub fn start(
        io: Arc<dyn TunnelIo>,
        role: Arc<dyn RoleHandler>,
        delegate: Arc<dyn TunnelDelegate>,
        set: &Arc<TunnelSet>,
    ) -> Tunnel {
        let inner = Arc::new(TunnelInner {
            id: set.next_id(),
            io,
            role,
            delegate,
            set: Arc::downgrade(set),
            state: Mutex::new(MuxState {
                connections: HashMap::new(),
                save_queue: VecDeque::new(),
            }),
            write_ready: Notify::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        let tunnel = Tunnel { inner };

        set.insert(&tunnel);
        tunnel.inner.delegate.tunnel_opened(&tunnel);

        let reader = tokio::spawn(read_loop(tunnel.clone()));
        let drainer = tokio::spawn(drain_loop(tunnel.clone()));
        {
            let mut tasks = tunnel.inner.tasks.lock().unwrap();
            tasks.push(reader);
            tasks.push(drainer);
        }
        tunnel
    }

    pub(crate) fn from_inner(inner: Arc<TunnelInner>) -> Tunnel {
        Tunnel { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn delegate(&self) -> &Arc<dyn TunnelDelegate> {
        &self.inner.delegate
    }

    pub(crate) fn role(&self) -> Arc<dyn RoleHandler> {
        self.inner.role.clone()
    }

    // ---- flow registry ----

    /// Create a connection for `id` and register it.
    ///
    /// The returned receiver delivers the flow's [`FlowEvent`]s to whichever
    /// task serves it. Fails on a duplicate identifier or a closed tunnel.
    pub fn attach_connection(
        &self,
        id: FlowId,
        exclusive: bool,
    ) -> TunnelResult<(Arc<Connection>, UnboundedReceiver<FlowEvent>)> {
        if self.is_closed() {
            return Err(TunnelError::BadConnection("tunnel is closed".into()));
        }
        let (conn, rx) = Connection::new(id, exclusive, Arc::downgrade(&self.inner));

        let mut state = self.inner.state.lock().unwrap();
        if state.connections.contains_key(&id) {
            return Err(TunnelError::BadConnection(format!(
                "duplicate flow identifier {id}"
            )));
        }
        // A flow born while output is queued starts out suspended.
        if !state.save_queue.is_empty() {
            conn.suspend();
        }
        state.connections.insert(id, conn.clone());
        drop(state);

        Ok((conn, rx))
    }

    pub fn connection(&self, id: FlowId) -> Option<Arc<Connection>> {
        self.inner.state.lock().unwrap().connections.get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().unwrap().connections.len()
    }

    pub fn connection_ids(&self) -> Vec<FlowId> {
        self.inner.state.lock().unwrap().connections.keys().copied().collect()
    }

    /// Drop `id` from the registry. Returns whether it was present.
    pub(crate) fn remove_connection(&self, id: FlowId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .connections
            .remove(&id)
            .is_some()
    }

    // ---- outbound path ----

    /// Serialize and send one message.
    ///
    /// Performs a best-effort direct write when nothing is queued; bytes the
    /// channel does not accept synchronously are parked on the save queue
    /// and every flow is suspended until the queue drains. A synchronous
    /// write error closes the tunnel. Returns `false` only when the message
    /// could not be serialized.
    pub fn write_message(&self, msg: &Message) -> bool {
        let frame = match FrameCodec::encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!(tunnel = self.id(), error = %e, "failed to encode message");
                return false;
            }
        };
        if self.is_closed() {
            trace!(tunnel = self.id(), "dropping write on closed tunnel");
            return true;
        }
        self.send_frame(frame);
        true
    }

    fn send_frame(&self, frame: Bytes) {
        let write_error: io::Error;
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.save_queue.is_empty() {
                state.save_queue.push_back(PendingFrame { frame, written: 0 });
                return;
            }

            let mut written = 0;
            loop {
                if written == frame.len() {
                    return;
                }
                match self.inner.io.try_write(&frame[written..]) {
                    Ok(0) => {
                        write_error =
                            io::Error::new(io::ErrorKind::WriteZero, "channel closed");
                        break;
                    }
                    Ok(n) => written += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        state.save_queue.push_back(PendingFrame { frame, written });
                        suspend_all(&state);
                        self.inner.write_ready.notify_one();
                        return;
                    }
                    Err(e) => {
                        write_error = e;
                        break;
                    }
                }
            }
        }
        error!(tunnel = self.id(), error = %write_error, "tunnel write failed");
        self.close();
    }

    /// Total bytes parked on the save queue.
    pub fn pending_output(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state
            .save_queue
            .iter()
            .map(|pending| pending.frame.len() - pending.written)
            .sum()
    }

    // ---- lifecycle ----

    /// Close the tunnel: abort every flow, drop queued output, stop both
    /// engine tasks, and deregister. Idempotent; the delegate's
    /// `tunnel_closed` fires exactly once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(tunnel = self.id(), "closing tunnel");

        let connections = {
            let mut state = self.inner.state.lock().unwrap();
            state.save_queue.clear();
            std::mem::take(&mut state.connections)
        };
        for conn in connections.values() {
            conn.abort();
        }

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        if let Some(set) = self.inner.set.upgrade() {
            set.remove(self.inner.id);
        }
        self.inner.delegate.tunnel_closed(self);
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn suspend_all(state: &MuxState) {
    for conn in state.connections.values() {
        conn.suspend();
    }
}

fn resume_all(state: &MuxState) {
    for conn in state.connections.values() {
        conn.resume();
    }
}

/// Read frames off the channel and feed the dispatch core until EOF, an IO
/// error, or a bad frame closes the tunnel.
async fn read_loop(tunnel: Tunnel) {
    let io = tunnel.inner.io.clone();
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = read_exact(io.as_ref(), &mut header).await {
            debug!(tunnel = tunnel.id(), error = %e, "tunnel read ended");
            tunnel.close();
            return;
        }

        let frame_len = match FrameCodec::frame_len(header) {
            Ok(len) => len,
            Err(e) => {
                error!(tunnel = tunnel.id(), error = %e, "bad frame header");
                tunnel.close();
                return;
            }
        };

        let mut payload = vec![0u8; frame_len - FRAME_HEADER_LEN];
        if let Err(e) = read_exact(io.as_ref(), &mut payload).await {
            warn!(tunnel = tunnel.id(), error = %e, "tunnel truncated mid-frame");
            tunnel.close();
            return;
        }

        let msg = match FrameCodec::decode_payload(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!(tunnel = tunnel.id(), error = %e, "undecodable frame");
                tunnel.close();
                return;
            }
        };

        dispatch::dispatch_message(&tunnel, msg).await;
        if tunnel.is_closed() {
            return;
        }
    }
}

/// Flush the save queue whenever the channel becomes writable; resumes all
/// flows once the queue is fully drained.
async fn drain_loop(tunnel: Tunnel) {
    let inner = &tunnel.inner;
    loop {
        inner.write_ready.notified().await;
        loop {
            if tunnel.is_closed() {
                return;
            }
            let pending = !inner.state.lock().unwrap().save_queue.is_empty();
            if !pending {
                break;
            }

            if let Err(e) = inner.io.writable().await {
                error!(tunnel = tunnel.id(), error = %e, "tunnel writability lost");
                tunnel.close();
                return;
            }

            let result = {
                let mut state = inner.state.lock().unwrap();
                match state.save_queue.pop_front() {
                    None => Ok(()),
                    Some(mut front) => match inner.io.try_write(&front.frame[front.written..]) {
                        Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "channel closed")),
                        Ok(n) => {
                            front.written += n;
                            if front.written < front.frame.len() {
                                state.save_queue.push_front(front);
                            } else if state.save_queue.is_empty() {
                                resume_all(&state);
                            }
                            Ok(())
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            state.save_queue.push_front(front);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                }
            };
            if let Err(e) = result {
                error!(tunnel = tunnel.id(), error = %e, "tunnel write failed");
                tunnel.close();
                return;
            }
        }
    }
}
