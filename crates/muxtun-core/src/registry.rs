//! Process-wide set of live tunnels

use crate::tunnel::Tunnel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// All tunnels currently alive in the process.
///
/// Owned by the embedder (there is no static singleton); tunnels insert
/// themselves on construction and remove themselves exactly once on close.
/// Exists so shutdown can tear every tunnel down in one call.
pub struct TunnelSet {
    next_id: AtomicU64,
    tunnels: Mutex<HashMap<u64, Tunnel>>,
}

impl TunnelSet {
    pub fn new() -> Arc<TunnelSet> {
        Arc::new(TunnelSet {
            next_id: AtomicU64::new(1),
            tunnels: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, tunnel: &Tunnel) {
        self.tunnels
            .lock()
            .unwrap()
            .insert(tunnel.id(), tunnel.clone());
    }

    pub(crate) fn remove(&self, id: u64) {
        self.tunnels.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every live tunnel. Used at shutdown.
    pub fn close_all(&self) {
        let tunnels: Vec<Tunnel> = self.tunnels.lock().unwrap().values().cloned().collect();
        if !tunnels.is_empty() {
            info!(count = tunnels.len(), "closing all tunnels");
        }
        for tunnel in tunnels {
            tunnel.close();
        }
    }
}
