//! Registry of live connections.

use std::sync::Arc;

use dashmap::DashMap;

use super::Connection;

/// Concurrent registry of connections keyed by connection id.
///
/// Owned by the server; the accept loop consults [`ConnectionManager::len`]
/// to back-pressure accepts at `max_conn`.
#[derive(Default)]
pub struct ConnectionManager {
    conns: DashMap<u64, Arc<Connection>>,
}

impl ConnectionManager {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Track a freshly accepted connection.
    pub fn add(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.id(), conn);
        log::debug!("connection added, total {}", self.len());
    }

    /// Drop a connection from the registry.
    pub fn remove(&self, conn_id: u64) { self.conns.remove(&conn_id); }

    /// Look up a live connection.
    #[must_use]
    pub fn get(&self, conn_id: u64) -> Option<Arc<Connection>> {
        self.conns.get(&conn_id).map(|entry| Arc::clone(&entry))
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn len(&self) -> usize { self.conns.len() }

    /// Whether no connections are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.conns.is_empty() }

    /// Stop every connection and clear the registry.
    ///
    /// Each connection's own teardown removes it individually as its tasks
    /// wind down; clearing here just drops the strong references early.
    pub fn clear(&self) {
        for entry in &self.conns {
            entry.value().stop();
        }
        self.conns.clear();
    }
}
