//! Watchers and cross-handle broadcast.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{open_test_db, test_options, user};
use futures::{FutureExt, StreamExt};
use serde_json::json;
use stow_engine::adapter::MemoryAdapter;
use stow_engine::{
    Database, Key, LocalBroadcast, MutationEvent, MutationKind, WatchOptions,
};

fn memory() -> Arc<MemoryAdapter> {
    Arc::new(MemoryAdapter::new())
}

async fn next_event(watcher: &mut stow_engine::Watcher) -> MutationEvent {
    tokio::time::timeout(Duration::from_secs(1), watcher.next())
        .await
        .expect("event within a second")
        .expect("watcher open")
}

// ============================================================================
// Local Watchers
// ============================================================================

#[tokio::test]
async fn every_write_notifies_in_order() {
    let db = open_test_db("watch-order", memory()).await;
    let users = db.store("users").unwrap();
    let mut watcher = users.watch(WatchOptions::all());

    users.put(user(1, 20)).await.unwrap();
    users.put_many(vec![user(2, 20), user(3, 20)]).await.unwrap();
    users.delete(1).await.unwrap();
    users.clear().await.unwrap();

    let kinds: Vec<_> = (0..5)
        .map(|_| watcher.next().now_or_never().flatten().map(|e| (e.kind, e.key)))
        .collect();
    assert_eq!(
        kinds,
        vec![
            Some((MutationKind::Put, Some(Key::from(1)))),
            Some((MutationKind::Put, Some(Key::from(2)))),
            Some((MutationKind::Put, Some(Key::from(3)))),
            Some((MutationKind::Delete, Some(Key::from(1)))),
            Some((MutationKind::Clear, None)),
        ]
    );
}

#[tokio::test]
async fn put_events_carry_generated_keys() {
    let db = open_test_db("watch-generated", memory()).await;
    let logs = db.store("logs").unwrap();
    let mut watcher = logs.watch(WatchOptions::all());

    logs.put(json!({"msg": "hi"})).await.unwrap();
    let event = next_event(&mut watcher).await;
    assert_eq!(event.store, "logs");
    assert_eq!(event.value, Some(json!({"id": 1, "msg": "hi"})));
}

#[tokio::test]
async fn key_filter_and_independent_watchers() {
    let db = open_test_db("watch-filter", memory()).await;
    let users = db.store("users").unwrap();
    let mut only_two = users.watch(WatchOptions::key(2));
    let mut everything = users.watch(WatchOptions::all());
    let mut other_store = db.store("logs").unwrap().watch(WatchOptions::all());

    users.put(user(1, 20)).await.unwrap();
    users.put(user(2, 20)).await.unwrap();

    assert_eq!(next_event(&mut only_two).await.key, Some(Key::from(2)));
    assert_eq!(next_event(&mut everything).await.key, Some(Key::from(1)));
    assert_eq!(next_event(&mut everything).await.key, Some(Key::from(2)));
    assert!(other_store.next().now_or_never().is_none());
}

#[tokio::test]
async fn failed_writes_do_not_notify() {
    let db = open_test_db("watch-failed", memory()).await;
    let users = db.store("users").unwrap();
    users.put(user(1, 20)).await.unwrap();
    let mut watcher = users.watch(WatchOptions::all());

    let duplicate = json!({"id": 2, "age": 1, "email": "user1@example.com"});
    assert!(users.put(duplicate).await.is_err());
    assert!(watcher.next().now_or_never().is_none());
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn sibling_handles_see_each_other_through_broadcast() {
    let adapter = memory();
    let transport = Arc::new(LocalBroadcast::new());
    let a = Database::open("shared", test_options(adapter.clone()).broadcast(transport.clone()))
        .await
        .unwrap();
    let b = Database::open("shared", test_options(adapter).broadcast(transport))
        .await
        .unwrap();

    let mut on_b = b.store("users").unwrap().watch(WatchOptions::all());
    let mut on_a = a.store("users").unwrap().watch(WatchOptions::all());
    a.store("users").unwrap().put(user(7, 30)).await.unwrap();

    let local = next_event(&mut on_a).await;
    let remote = next_event(&mut on_b).await;
    assert_eq!(local, remote);
    assert_eq!(remote.key, Some(Key::from(7)));

    // Nothing echoes back to the writer
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(on_a.next().now_or_never().is_none());
}

#[tokio::test]
async fn other_databases_are_not_notified() {
    let transport = Arc::new(LocalBroadcast::new());
    let a = Database::open("alpha", test_options(memory()).broadcast(transport.clone()))
        .await
        .unwrap();
    let b = Database::open("beta", test_options(memory()).broadcast(transport))
        .await
        .unwrap();

    let mut on_b = b.store("users").unwrap().watch(WatchOptions::all());
    a.store("users").unwrap().put(user(1, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(on_b.next().now_or_never().is_none());
}

#[tokio::test]
async fn no_transport_is_local_only() {
    let db = open_test_db("local-only", memory()).await;
    let users = db.store("users").unwrap();
    let mut watcher = users.watch(WatchOptions::all());
    users.put(user(1, 1)).await.unwrap();
    assert_eq!(next_event(&mut watcher).await.kind, MutationKind::Put);
}

#[tokio::test]
async fn closing_stops_receiving_broadcasts() {
    let adapter = memory();
    let transport = Arc::new(LocalBroadcast::new());
    let a = Database::open("closing", test_options(adapter.clone()).broadcast(transport.clone()))
        .await
        .unwrap();
    let b = Database::open("closing", test_options(adapter).broadcast(transport))
        .await
        .unwrap();

    let mut on_b = b.store("users").unwrap().watch(WatchOptions::all());
    b.close().await.unwrap();
    a.store("users").unwrap().put(user(1, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(on_b.next().now_or_never().is_none());
}
