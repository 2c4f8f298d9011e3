//! Relay client: a [`BroadcastTransport`] backed by one relay connection.
//!
//! Handles in different processes that open the same database name with a
//! `RelayTransport` pointed at the same relay see each other's committed
//! writes. Handles sharing one `RelayTransport` in the same process also see
//! each other directly without a round trip through the relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use stow_engine::{BroadcastTransport, Envelope};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::websocket::{ClientMessage, ServerMessage};

/// Capacity of each per-database channel.
const CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared with the reader task.
#[derive(Default)]
struct Shared {
    channels: DashMap<String, broadcast::Sender<Envelope>>,
    joined: DashMap<String, Uuid>,
    changed: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn sender(&self, database: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(database.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// Broadcast transport that talks to a `stow-relay` server over WebSocket.
pub struct RelayTransport {
    url: String,
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RelayTransport {
    /// Connect to the relay at `url` (for example `ws://127.0.0.1:4000/ws`).
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;
        tracing::info!(url = %url, "connected to relay");

        let (ws_write, ws_read) = ws_stream.split();
        let (outbound, write_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let writer = tokio::spawn(run_write_loop(ws_write, write_rx));
        let reader = tokio::spawn(run_read_loop(ws_read, shared.clone()));

        Ok(Self {
            url,
            outbound,
            shared,
            reader,
            writer,
        })
    }

    /// Relay address this transport is connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the relay connection has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait until the relay has acknowledged joining `database`.
    ///
    /// Returns the relay's connection id. Fails if the connection ends first.
    pub async fn joined(&self, database: &str) -> Result<Uuid> {
        loop {
            let changed = self.shared.changed.notified();
            if let Some(id) = self.shared.joined.get(database) {
                return Ok(*id);
            }
            if self.is_closed() {
                return Err(RelayError::Protocol(format!(
                    "relay connection closed before joining '{database}'"
                )));
            }
            changed.await;
        }
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(text)
            .map_err(|_| RelayError::Protocol("relay connection closed".to_string()))
    }
}

impl BroadcastTransport for RelayTransport {
    fn publish(&self, envelope: Envelope) -> stow_engine::Result<()> {
        // Local handles first; no receivers is not an error
        let _ = self.shared.sender(&envelope.database).send(envelope.clone());
        self.send(&ClientMessage::Publish { envelope })?;
        Ok(())
    }

    fn subscribe(&self, database: &str) -> stow_engine::Result<BoxStream<'static, Envelope>> {
        let first = !self.shared.channels.contains_key(database);
        let rx = self.shared.sender(database).subscribe();
        if first {
            self.send(&ClientMessage::Join {
                database: database.to_string(),
            })?;
        }
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Write loop: drains the outbound channel into text frames.
async fn run_write_loop(
    mut ws_write: SplitSink<WsStream, Message>,
    mut write_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = write_rx.recv().await {
        if let Err(e) = ws_write.send(Message::Text(text)).await {
            tracing::warn!("relay write failed: {}", e);
            break;
        }
    }
    let _ = ws_write.close().await;
}

/// Read loop: routes forwarded events to local subscribers.
async fn run_read_loop(mut ws_read: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(frame) = ws_read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("relay read failed: {}", e);
                break;
            }
        };

        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Event { envelope, .. }) => {
                if let Some(sender) = shared.channels.get(&envelope.database) {
                    let _ = sender.send(envelope);
                }
            }
            Ok(ServerMessage::Joined {
                connection_id,
                database,
            }) => {
                tracing::debug!(conn_id = %connection_id, database = %database, "joined relay database");
                shared.joined.insert(database, connection_id);
                shared.changed.notify_waiters();
            }
            Ok(ServerMessage::Pong) => {}
            Ok(ServerMessage::Error { message }) => {
                tracing::warn!(message = %message, "relay reported an error");
            }
            Err(e) => {
                tracing::warn!("invalid relay message: {}", e);
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.changed.notify_waiters();
    tracing::info!("relay connection closed");
}
