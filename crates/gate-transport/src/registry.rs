//! Client state registry.
//!
//! Maps live connection ids to their [`ClientConnection`] and keeps the
//! ordered list of connections whose close event has not fired yet. The
//! registry holds strong references, so eviction on close is mandatory:
//! [`ClientRegistry::unregister`] is called from the socket task on every
//! exit path and is the only place a wrapper's close event is fired.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::{ClientConnection, ConnectionId};

#[derive(Debug, Default)]
struct RegistryInner {
    /// Live connections in open order
    live: Vec<ConnectionId>,
    clients: HashMap<ConnectionId, Arc<ClientConnection>>,
}

/// Tracks live connections and their wrappers.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the wrapper and append its connection to the live list.
    pub fn register(&self, client: Arc<ClientConnection>) {
        let id = client.id();
        let mut inner = self.inner.lock();
        if !inner.live.contains(&id) {
            inner.live.push(id);
        }
        inner.clients.insert(id, client);
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.lock().clients.get(&id).cloned()
    }

    /// Remove the connection and fire its wrapper's close event with `code`.
    pub fn unregister(&self, id: ConnectionId, code: u16) -> Option<Arc<ClientConnection>> {
        let client = {
            let mut inner = self.inner.lock();
            inner.live.retain(|live| *live != id);
            inner.clients.remove(&id)
        };
        // Fired outside the lock; event consumers may call back into the registry.
        if let Some(client) = &client {
            client.emit_close(code);
        }
        client
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.inner.lock().live.contains(&id)
    }

    /// Live connection ids in the order they opened.
    pub fn live_connections(&self) -> Vec<ConnectionId> {
        self.inner.lock().live.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
