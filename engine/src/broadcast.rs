//! Cross-context change propagation.
//!
//! A database opened with a [`BroadcastTransport`] publishes every committed
//! [`MutationEvent`] wrapped in an [`Envelope`] and dispatches envelopes
//! published by other handles of the same database name to its local
//! watchers. Envelopes carry the publishing handle's origin id so a handle
//! never re-dispatches its own events, and received events are never
//! re-published. Delivery is best effort.

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{error::Result, MutationEvent};

/// Capacity of each per-database channel in [`LocalBroadcast`].
const CHANNEL_CAPACITY: usize = 256;

/// A mutation event tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Database name the event belongs to
    pub database: String,
    /// Handle that published it
    pub origin: Uuid,
    /// The event itself
    pub event: MutationEvent,
}

/// A channel shared by every handle of a database name.
pub trait BroadcastTransport: Send + Sync {
    /// Publish an envelope to every subscriber of its database.
    fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Receive envelopes published for `database`, including this handle's own.
    fn subscribe(&self, database: &str) -> Result<BoxStream<'static, Envelope>>;
}

/// In-process transport over `tokio::sync::broadcast` channels.
///
/// Handles opened with the same `LocalBroadcast` (or a clone of it) see each
/// other's writes. Slow receivers skip events they lagged behind on.
#[derive(Clone, Default)]
pub struct LocalBroadcast {
    channels: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalBroadcast {
    /// Create a transport with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, database: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(database.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl BroadcastTransport for LocalBroadcast {
    fn publish(&self, envelope: Envelope) -> Result<()> {
        // No receivers is not an error
        let _ = self.sender(&envelope.database).send(envelope);
        Ok(())
    }

    fn subscribe(&self, database: &str) -> Result<BoxStream<'static, Envelope>> {
        let rx = self.sender(database).subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => return Some((envelope, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "broadcast receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Key;

    #[tokio::test]
    async fn subscribers_only_see_their_database() {
        let transport = LocalBroadcast::new();
        let mut users = transport.subscribe("app").unwrap();
        let origin = Uuid::new_v4();

        transport
            .publish(Envelope {
                database: "other".into(),
                origin,
                event: MutationEvent::clear("x"),
            })
            .unwrap();
        transport
            .publish(Envelope {
                database: "app".into(),
                origin,
                event: MutationEvent::delete("users", Key::from(1)),
            })
            .unwrap();

        let received = users.next().await.unwrap();
        assert_eq!(received.database, "app");
        assert_eq!(received.origin, origin);
    }

    #[test]
    fn envelope_serializes_event_inline() {
        let envelope = Envelope {
            database: "app".into(),
            origin: Uuid::nil(),
            event: MutationEvent::clear("users"),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event"]["type"], "clear");
        assert_eq!(json["origin"], Uuid::nil().to_string());
    }
}
