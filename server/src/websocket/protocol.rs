//! Relay wire protocol.
//!
//! All messages are JSON text frames tagged by `type` and use snake_case for
//! field names. Envelopes keep the engine's own encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stow_engine::Envelope;
use uuid::Uuid;

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Receive events for a database name.
    Join {
        /// Database name
        database: String,
    },

    /// Forward an envelope to every other connection joined to its database.
    Publish {
        /// Committed change
        envelope: Envelope,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a join.
    Joined {
        /// Relay-assigned id for this connection
        connection_id: Uuid,
        /// Database that was joined
        database: String,
    },

    /// An envelope published by another connection.
    Event {
        /// The forwarded change
        envelope: Envelope,
        /// When the relay received it
        received_at: DateTime<Utc>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        /// Error description
        message: String,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Wrap an envelope for forwarding, stamped now.
    pub fn event(envelope: Envelope) -> Self {
        ServerMessage::Event {
            envelope,
            received_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stow_engine::MutationEvent;

    #[test]
    fn test_client_message_deserialization() {
        let json = r#"{"type": "join", "database": "app"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Join {
                database: "app".to_string()
            }
        );

        let json = r#"{"type": "ping"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_publish_carries_envelope() {
        let json = format!(
            r#"{{"type": "publish", "envelope": {{"database": "app", "origin": "{}", "event": {{"store": "users", "type": "clear"}}}}}}"#,
            Uuid::nil()
        );
        let msg: ClientMessage = serde_json::from_str(&json).unwrap();
        match msg {
            ClientMessage::Publish { envelope } => {
                assert_eq!(envelope.database, "app");
                assert_eq!(envelope.event, MutationEvent::clear("users"));
            }
            other => panic!("Expected Publish message, got {other:?}"),
        }
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::Pong;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let msg = ServerMessage::error("not joined");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"not joined""#));

        let msg = ServerMessage::Joined {
            connection_id: Uuid::nil(),
            database: "app".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "joined");
        assert_eq!(value["connection_id"], Uuid::nil().to_string());
    }
}
