//! Change notifications.
//!
//! Every successful write produces a [`MutationEvent`]. A [`WatchHub`] keeps
//! the subscribers of one database, keyed by store, and dispatches events to
//! them synchronously from the writing task. Subscriptions are RAII guards:
//! dropping one unsubscribes it.
//!
//! [`Watcher`] is the consumer-facing stream built on top: events are queued
//! into an unbounded channel as they are dispatched and handed out as the
//! stream is polled. It never ends on its own; drop it to stop watching.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{Key, StoreName};

/// The kind of write that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Put,
    Delete,
    Clear,
}

/// A committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Store the write happened in
    pub store: StoreName,
    /// What happened
    #[serde(rename = "type")]
    pub kind: MutationKind,
    /// Affected key (absent for `clear`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    /// Stored value (only for `put`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl MutationEvent {
    /// A record was written.
    pub fn put(store: impl Into<StoreName>, key: Key, value: Value) -> Self {
        Self {
            store: store.into(),
            kind: MutationKind::Put,
            key: Some(key),
            value: Some(value),
        }
    }

    /// A record was removed.
    pub fn delete(store: impl Into<StoreName>, key: Key) -> Self {
        Self {
            store: store.into(),
            kind: MutationKind::Delete,
            key: Some(key),
            value: None,
        }
    }

    /// A store was emptied.
    pub fn clear(store: impl Into<StoreName>) -> Self {
        Self {
            store: store.into(),
            kind: MutationKind::Clear,
            key: None,
            value: None,
        }
    }
}

/// Callback invoked for every event on a watched store.
pub type EventSink = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    sink: EventSink,
}

/// Subscriber registry for one database.
#[derive(Default)]
pub struct WatchHub {
    subscribers: DashMap<StoreName, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl WatchHub {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `sink` for events on `store`.
    pub fn subscribe(self: &Arc<Self>, store: &str, sink: EventSink) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(store.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        Subscription {
            hub: Arc::downgrade(self),
            store: store.to_string(),
            id,
        }
    }

    /// Deliver `event` to every subscriber of its store, in subscription order.
    pub fn dispatch(&self, event: &MutationEvent) {
        // Sinks run outside the map guard so they may subscribe or unsubscribe
        let sinks: Vec<EventSink> = match self.subscribers.get(&event.store) {
            Some(subs) => subs.iter().map(|s| s.sink.clone()).collect(),
            None => return,
        };
        for sink in sinks {
            sink(event);
        }
    }

    /// Number of live subscriptions on `store`.
    pub fn subscriber_count(&self, store: &str) -> usize {
        self.subscribers.get(store).map(|s| s.len()).unwrap_or(0)
    }

    fn unsubscribe(&self, store: &str, id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(store) {
            subs.retain(|s| s.id != id);
        }
        self.subscribers.remove_if(store, |_, subs| subs.is_empty());
    }
}

/// Keeps a subscription alive; dropping it unsubscribes.
pub struct Subscription {
    hub: Weak<WatchHub>,
    store: StoreName,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.store, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("store", &self.store)
            .field("id", &self.id)
            .finish()
    }
}

/// Options for [`crate::StoreAccessor::watch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Only deliver events for this key. `clear` events are always delivered.
    pub key: Option<Key>,
}

impl WatchOptions {
    /// Watch the whole store.
    pub fn all() -> Self {
        Self::default()
    }

    /// Watch a single key.
    pub fn key(key: impl Into<Key>) -> Self {
        Self {
            key: Some(key.into()),
        }
    }
}

/// A stream of [`MutationEvent`]s for one store.
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<MutationEvent>,
    _subscription: Subscription,
}

impl Watcher {
    pub(crate) fn new(hub: &Arc<WatchHub>, store: &str, options: WatchOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = options.key;
        let sink: EventSink = Arc::new(move |event: &MutationEvent| {
            let wanted = match (&filter, &event.key) {
                (None, _) | (_, None) => true,
                (Some(want), Some(key)) => want == key,
            };
            if wanted {
                let _ = tx.send(event.clone());
            }
        });
        Self {
            rx,
            _subscription: hub.subscribe(store, sink),
        }
    }
}

impl Stream for Watcher {
    type Item = MutationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
