//! Connection registry keyed by (user, case).
//!
//! The registry is the only owner of connection lifetime: registering over
//! an existing key closes the stale connection, and removal closes the
//! removed one. Read paths hand out `Arc` clones so callers never iterate
//! while holding the lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use casehub_core::{CaseId, UserId};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::connection::ClientConnection;

/// Registry key: one live connection per (user, case).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Connected user.
    pub user: UserId,
    /// Case the connection is scoped to.
    pub case_id: CaseId,
}

impl ConnectionKey {
    /// Build a key.
    pub fn new(user: UserId, case_id: CaseId) -> Self {
        Self { user, case_id }
    }

    fn of(conn: &ClientConnection) -> Self {
        Self::new(conn.user.clone(), conn.case_id.clone())
    }
}

/// Maps (user, case) to the single live connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionKey, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Store `conn` under its (user, case) key.
    ///
    /// An existing connection for the same key is closed and returned
    /// (duplicate-login eviction).
    pub fn register(&self, conn: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        let key = ConnectionKey::of(&conn);
        let previous = {
            let mut connections = self.connections.write();
            let previous = connections.insert(key, conn.clone());
            if let Some(ref old) = previous {
                old.close();
            }
            previous
        };

        match &previous {
            Some(old) => info!(
                user = %conn.user,
                case_id = %conn.case_id,
                old_conn = %old.id,
                new_conn = %conn.id,
                "duplicate login, previous connection evicted"
            ),
            None => debug!(user = %conn.user, case_id = %conn.case_id, conn_id = %conn.id, "connection registered"),
        }
        previous
    }

    /// Remove whatever connection is registered for (user, case).
    ///
    /// Returns the removed connection, already closed.
    pub fn unregister(&self, user: &UserId, case_id: &CaseId) -> Option<Arc<ClientConnection>> {
        let key = ConnectionKey::new(user.clone(), case_id.clone());
        let removed = self.connections.write().remove(&key);
        if let Some(ref conn) = removed {
            conn.close();
        }
        removed
    }

    /// Remove `conn` only if it is still the registered connection for its key.
    ///
    /// A session that lost a duplicate-login race calls this on teardown and
    /// must not remove its replacement. Returns `true` if `conn` was removed.
    pub fn unregister_connection(&self, conn: &ClientConnection) -> bool {
        let key = ConnectionKey::of(conn);
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(&key) {
                Some(current) if current.id == conn.id => connections.remove(&key),
                _ => None,
            }
        };
        conn.close();
        removed.is_some()
    }

    /// Connection for (user, case), if live.
    pub fn lookup(&self, user: &UserId, case_id: &CaseId) -> Option<Arc<ClientConnection>> {
        let key = ConnectionKey::new(user.clone(), case_id.clone());
        self.connections.read().get(&key).cloned()
    }

    /// All live connections of `user`, across cases.
    pub fn connections_of(&self, user: &UserId) -> Vec<Arc<ClientConnection>> {
        self.connections
            .read()
            .values()
            .filter(|conn| &conn.user == user)
            .cloned()
            .collect()
    }

    /// Resolve the live connections of `users` within one case, under a
    /// single read lock. Offline users are skipped.
    pub fn resolve(&self, case_id: &CaseId, users: &[UserId]) -> Vec<Arc<ClientConnection>> {
        let connections = self.connections.read();
        users
            .iter()
            .filter_map(|user| {
                connections
                    .get(&ConnectionKey::new(user.clone(), case_id.clone()))
                    .cloned()
            })
            .collect()
    }

    /// Sorted, de-duplicated users connected to `case_id`.
    pub fn connected_users(&self, case_id: &CaseId) -> Vec<UserId> {
        let users: BTreeSet<UserId> = self
            .connections
            .read()
            .keys()
            .filter(|key| &key.case_id == case_id)
            .map(|key| key.user.clone())
            .collect();
        users.into_iter().collect()
    }

    /// Number of live connections scoped to `case_id`.
    pub fn count_for_case(&self, case_id: &CaseId) -> usize {
        self.connections
            .read()
            .keys()
            .filter(|key| &key.case_id == case_id)
            .count()
    }

    /// Total live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close every live connection without removing it.
    ///
    /// Sessions observe the close and run their own unregister cascade.
    pub fn close_all(&self) -> usize {
        let snapshot: Vec<Arc<ClientConnection>> =
            self.connections.read().values().cloned().collect();
        for conn in &snapshot {
            conn.close();
        }
        snapshot.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
