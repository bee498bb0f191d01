//! The client registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::ProtoError;
use crate::server::subs::SubState;

/// A registered client connection.
pub struct ClientState {
    /// The client's unique ID.
    pub client_id: String,
    /// The inbox on which the client answers heartbeat probes.
    pub hb_inbox: String,
    inner: Mutex<ClientInner>,
}

struct ClientInner {
    /// Back-references to the subscriptions owned by this client.
    subs: Vec<Arc<SubState>>,
    /// Consecutive failed heartbeats.
    fhb: u32,
    /// The heartbeat probe task.
    hb_task: Option<JoinHandle<()>>,
}

impl ClientState {
    fn new(client_id: &str, hb_inbox: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            hb_inbox: hb_inbox.to_string(),
            inner: Mutex::new(ClientInner { subs: Vec::with_capacity(4), fhb: 0, hb_task: None }),
        }
    }

    /// Attach the heartbeat probe task.
    pub fn set_hb_task(&self, task: JoinHandle<()>) {
        self.inner.lock().hb_task = Some(task);
    }

    /// Add a subscription back-reference.
    pub fn add_sub(&self, sub: &Arc<SubState>) {
        self.inner.lock().subs.push(sub.clone());
    }

    /// Remove a subscription back-reference.
    pub fn remove_sub(&self, sub: &Arc<SubState>) {
        self.inner.lock().subs.retain(|entry| !Arc::ptr_eq(entry, sub));
    }

    /// Snapshot the client's subscriptions.
    pub fn snapshot_subs(&self) -> Vec<Arc<SubState>> {
        self.inner.lock().subs.clone()
    }

    /// The current failed-heartbeat count.
    pub fn failed_heartbeats(&self) -> u32 {
        self.inner.lock().fhb
    }

    /// Reset the failed-heartbeat count after a successful probe.
    pub fn reset_failed_heartbeats(&self) {
        self.inner.lock().fhb = 0;
    }

    /// Bump the failed-heartbeat count, returning the new value.
    pub fn bump_failed_heartbeats(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.fhb += 1;
        inner.fhb
    }

    fn abort_hb_task(&self) {
        if let Some(task) = self.inner.lock().hb_task.take() {
            task.abort();
        }
    }
}

/// The registry of connected clients.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientState>>>,
}

impl ClientRegistry {
    /// Create a new instance.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { clients: RwLock::new(HashMap::new()) }
    }

    /// Register a new client, enforcing ID uniqueness.
    pub fn register(&self, client_id: &str, hb_inbox: &str) -> Result<Arc<ClientState>, ProtoError> {
        let mut clients = self.clients.write();
        if clients.contains_key(client_id) {
            return Err(ProtoError::DuplicateClient);
        }
        let client = Arc::new(ClientState::new(client_id, hb_inbox));
        clients.insert(client_id.to_string(), client.clone());
        Ok(client)
    }

    /// Remove a client registration, stopping its heartbeat task.
    pub fn unregister(&self, client_id: &str) -> Option<Arc<ClientState>> {
        let client = self.clients.write().remove(client_id)?;
        client.abort_hb_task();
        Some(client)
    }

    /// Look up a client by ID.
    pub fn lookup(&self, client_id: &str) -> Option<Arc<ClientState>> {
        self.clients.read().get(client_id).cloned()
    }

    /// The number of registered clients.
    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    /// Remove every registration, stopping all heartbeat tasks.
    pub fn drain(&self) -> Vec<Arc<ClientState>> {
        let drained: Vec<_> = self.clients.write().drain().map(|(_, client)| client).collect();
        for client in drained.iter() {
            client.abort_hb_task();
        }
        drained
    }
}
