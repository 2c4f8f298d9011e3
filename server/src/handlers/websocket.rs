//! WebSocket handler for the relay.
//!
//! Handles WebSocket connections, records joins and forwards published
//! envelopes to the other members of their database.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};
use crate::AppState;

/// GET /ws - Upgrade to a relay connection.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let conn_manager = state.conn_manager.clone();
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, conn_manager))
}

/// Handle an established WebSocket connection.
///
/// Outgoing messages go through the connection's channel so forwarded events
/// and direct replies share one writer task.
pub async fn handle_websocket_connection(socket: WebSocket, conn_manager: Arc<ConnectionManager>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = conn_manager.register(tx);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(reply) = process_message(text.as_str(), &conn_manager, conn_id) {
                    conn_manager.send_to(conn_id, reply);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(conn_id = %conn_id, "Binary messages not supported");
                conn_manager.send_to(conn_id, ServerMessage::error("binary frames not supported"));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::debug!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = conn_manager.connection_count(),
        "relay client disconnected"
    );
}

/// Process a client message and return the direct reply, if any.
fn process_message(
    text: &str,
    conn_manager: &ConnectionManager,
    conn_id: Uuid,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(format!("Invalid message format: {}", e)));
        }
    };

    match client_msg {
        ClientMessage::Join { database } => {
            if database.is_empty() {
                return Some(ServerMessage::error("database name must not be empty"));
            }
            conn_manager.join(conn_id, &database);
            Some(ServerMessage::Joined {
                connection_id: conn_id,
                database,
            })
        }

        ClientMessage::Publish { envelope } => {
            if !conn_manager.is_joined(conn_id, &envelope.database) {
                return Some(ServerMessage::error(format!(
                    "not joined to database '{}'",
                    envelope.database
                )));
            }
            let database = envelope.database.clone();
            conn_manager.broadcast_except(&database, conn_id, ServerMessage::event(envelope));
            None
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
