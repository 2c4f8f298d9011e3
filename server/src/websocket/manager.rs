//! WebSocket connection manager.
//!
//! Tracks active relay connections and which database names each one has
//! joined, and forwards events between connections of the same database.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: Uuid,
    /// Database names joined so far
    pub databases: Vec<String>,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<Uuid, Connection>,
    /// Connection IDs by joined database name.
    by_database: DashMap<String, Vec<Uuid>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection and return its ID.
    pub fn register(&self, sender: MessageSender) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.connections.insert(
            conn_id,
            Connection {
                id: conn_id,
                databases: Vec::new(),
                sender,
            },
        );
        tracing::info!(conn_id = %conn_id, "relay connection registered");
        conn_id
    }

    /// Add `database` to the connection's joined set.
    ///
    /// Returns false when the connection is unknown. Joining twice is a no-op.
    pub fn join(&self, conn_id: Uuid, database: &str) -> bool {
        let Some(mut conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if conn.databases.iter().any(|d| d == database) {
            return true;
        }
        conn.databases.push(database.to_string());
        drop(conn);

        self.by_database
            .entry(database.to_string())
            .or_default()
            .push(conn_id);
        tracing::debug!(conn_id = %conn_id, database = %database, "relay connection joined");
        true
    }

    /// Whether the connection has joined `database`.
    pub fn is_joined(&self, conn_id: Uuid, database: &str) -> bool {
        self.connections
            .get(&conn_id)
            .is_some_and(|conn| conn.databases.iter().any(|d| d == database))
    }

    /// Unregister a connection and leave all its databases.
    pub fn unregister(&self, conn_id: Uuid) {
        if let Some((_, conn)) = self.connections.remove(&conn_id) {
            for database in &conn.databases {
                if let Some(mut members) = self.by_database.get_mut(database) {
                    members.retain(|id| *id != conn_id);
                    // Clean up empty entries
                    if members.is_empty() {
                        drop(members);
                        self.by_database.remove(database);
                    }
                }
            }
            tracing::info!(conn_id = %conn_id, "relay connection unregistered");
        }
    }

    /// Send a message to every connection joined to `database` except the sender.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_except(&self, database: &str, sender: Uuid, message: ServerMessage) -> usize {
        // Copy the member list so no shard lock is held while sending
        let members = match self.by_database.get(database) {
            Some(members) => members.clone(),
            None => return 0,
        };

        let mut sent_count = 0;
        for conn_id in members.into_iter().filter(|id| *id != sender) {
            if self.send_to(conn_id, message.clone()) {
                sent_count += 1;
            }
        }

        tracing::debug!(
            sender = %sender,
            database = %database,
            recipients = sent_count,
            "forwarded event"
        );
        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: Uuid, message: ServerMessage) -> bool {
        self.connections
            .get(&conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of databases with at least one joined connection.
    pub fn database_count(&self) -> usize {
        self.by_database.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_join_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register(tx);
        assert!(manager.join(conn_id, "app"));
        assert!(manager.join(conn_id, "app"));
        assert!(manager.is_joined(conn_id, "app"));
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.database_count(), 1);

        manager.unregister(conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.database_count(), 0);
        assert!(!manager.join(conn_id, "app"));
    }

    #[test]
    fn test_broadcast_stays_within_database() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();

        let conn1 = manager.register(tx1);
        let conn2 = manager.register(tx2);
        let conn3 = manager.register(tx3);
        manager.join(conn1, "app");
        manager.join(conn2, "app");
        manager.join(conn3, "other");

        // Broadcast from conn1 should only reach conn2
        let sent = manager.broadcast_except("app", conn1, ServerMessage::Pong);
        assert_eq!(sent, 1);

        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv().unwrap(), ServerMessage::Pong));
        assert!(rx3.try_recv().is_err());
    }
}
