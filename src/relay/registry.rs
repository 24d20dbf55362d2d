use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::connection::Connection;
use crate::error::RelayError;

/// The set of currently open connections, keyed by identifier.
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. An existing registration under the same id is left
    /// untouched.
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), RelayError> {
        let mut connections = self.connections.write().await;
        let id = connection.id();
        if connections.contains_key(&id) {
            return Err(RelayError::DuplicateIdentifier(id));
        }
        connections.insert(id, connection);
        debug!(conn_id = %id, "registered connection");
        Ok(())
    }

    /// Removes a connection if present. Returns whether it was.
    pub async fn unregister(&self, id: &Uuid) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            debug!(conn_id = %id, "unregistered connection");
        }
        removed
    }

    /// Point-in-time copy; the lock is released before this returns.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, id: &Uuid) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }
}
