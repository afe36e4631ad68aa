//! Registry of live connections and their roles.
//!
//! A connection holds exactly one role at a time. Registering an already
//! known connection replaces its role instead of adding a second entry.

use dashmap::DashMap;
use loadlink_protocol::Role;
use loadlink_transport::{Connection, ConnectionId};
use std::sync::Arc;
use tracing::debug;

struct Entry {
    conn: Arc<dyn Connection>,
    role: Role,
}

/// Thread-safe registry of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Entry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection under a role.
    ///
    /// Returns the role the connection held before, if it was known.
    pub fn register(&self, conn: Arc<dyn Connection>, role: Role) -> Option<Role> {
        let id = conn.id().clone();
        let previous = self
            .connections
            .insert(id.clone(), Entry { conn, role })
            .map(|entry| entry.role);

        debug!(connection = %id, role = %role, previous = ?previous, "Registered connection");
        previous
    }

    /// Remove a connection.
    ///
    /// Returns the role it held, or `None` if it was not registered.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Role> {
        let removed = self.connections.remove(id).map(|(_, entry)| entry.role);
        if let Some(role) = removed {
            debug!(connection = %id, role = %role, "Deregistered connection");
        }
        removed
    }

    /// Call `f` for every connection holding `role`.
    ///
    /// Iterates over a snapshot, so `f` may deregister connections.
    pub fn for_each(&self, role: Role, mut f: impl FnMut(&Arc<dyn Connection>)) {
        for conn in self.snapshot(role) {
            f(&conn);
        }
    }

    /// Handles of every connection holding `role`.
    #[must_use]
    pub fn snapshot(&self, role: Role) -> Vec<Arc<dyn Connection>> {
        self.connections
            .iter()
            .filter(|entry| entry.role == role)
            .map(|entry| Arc::clone(&entry.conn))
            .collect()
    }

    /// Number of connections holding `role`.
    #[must_use]
    pub fn count(&self, role: Role) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.role == role)
            .count()
    }

    /// The role a connection currently holds.
    #[must_use]
    pub fn role_of(&self, id: &ConnectionId) -> Option<Role> {
        self.connections.get(id).map(|entry| entry.role)
    }

    /// Total number of live connections, registered or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Per-role connection counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.connections.iter() {
            match entry.role {
                Role::Producer => stats.producers += 1,
                Role::Consumer => stats.consumers += 1,
                Role::Unregistered => stats.unregistered += 1,
            }
        }
        stats
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered producers.
    pub producers: usize,
    /// Registered consumers.
    pub consumers: usize,
    /// Connected but not yet registered.
    pub unregistered: usize,
}
