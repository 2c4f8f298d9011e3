//! # Stow Engine
//!
//! A uniform asynchronous data-access layer over heterogeneous storage
//! backends.
//!
//! Records are JSON values grouped into named stores. Every backend is
//! reached through the same record, query, transaction and watch API, so
//! application code does not change when the storage underneath does.
//!
//! ## Design Principles
//!
//! - **One contract**: backends implement [`adapter::Connection`] and
//!   present identical ordering, range and transaction semantics
//! - **Lazy**: queries describe work; cursors pull one record per poll and
//!   release the backend when dropped
//! - **Honest fidelity**: what a backend cannot do natively is emulated and
//!   reported through [`adapter::Capabilities`]
//!
//! ## Core Concepts
//!
//! ### Keys and ranges
//!
//! A [`Key`] is a number or a string. Numbers sort before strings. A
//! [`KeyRange`] is an interval over keys (or index values) with optional
//! open ends.
//!
//! ### Adapters
//!
//! An [`adapter::Adapter`] opens connections to databases on one backend:
//! - [`adapter::MemoryAdapter`] - ordered in-process engine
//! - [`adapter::BlobAdapter`] - flat blob store, ordered in-process
//! - [`adapter::SqliteAdapter`] - embedded SQL through `sqlx` (feature `sqlite`)
//!
//! ### Queries
//!
//! [`StoreAccessor::all`] and [`StoreAccessor::where_index`] start a
//! [`Query`]. Builder methods return new queries; terminal methods
//! (`to_array`, `count`, `first`, `stream`, ...) run them.
//!
//! ### Transactions
//!
//! [`Database::transaction`] runs a closure atomically over a set of stores.
//!
//! ### Watching and sync
//!
//! [`StoreAccessor::watch`] streams committed changes. A
//! [`sync::SyncSession`] keeps two databases converging, and a
//! [`BroadcastTransport`] shares changes between handles of one database.
//!
//! ## Quick Start
//!
//! ```rust
//! use futures::StreamExt;
//! use serde_json::json;
//! use stow_engine::{Database, IndexDef, OpenOptions, StoreOptions, WatchOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> stow_engine::Result<()> {
//! // 1. Open a database with one store
//! let db = Database::open(
//!     "quick-start",
//!     OpenOptions::new().schema(|builder, _| {
//!         builder.create_store(
//!             "users",
//!             StoreOptions::key("id").auto_increment().index(IndexDef::new("age")),
//!         );
//!         Ok(())
//!     }),
//! )
//! .await?;
//!
//! // 2. Write records
//! let users = db.store("users")?;
//! let mut changes = users.watch(WatchOptions::all());
//! let id = users.put(json!({"name": "Alice", "age": 31})).await?;
//! users.put(json!({"name": "Bob", "age": 27})).await?;
//! assert_eq!(changes.next().await.and_then(|event| event.key), Some(id));
//!
//! // 3. Query through an index
//! let adults = users.where_index("age")?.gte(30).to_array().await?;
//! assert_eq!(adults.len(), 1);
//! assert_eq!(adults[0]["name"], "Alice");
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod broadcast;
pub mod database;
pub mod error;
pub mod key;
pub mod query;
pub mod range;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod watch;

// Re-export main types at crate root
pub use broadcast::{BroadcastTransport, Envelope, LocalBroadcast};
pub use database::{Database, OpenOptions};
pub use error::{Error, Result};
pub use key::Key;
pub use query::{Predicate, Query};
pub use range::{Direction, KeyRange};
pub use schema::{IndexDef, Schema, SchemaBuilder, StoreOptions, StoreSchema};
pub use snapshot::{DatabaseSnapshot, StoreSnapshot};
pub use store::StoreAccessor;
pub use sync::{
    ConflictPolicy, SyncApplyError, SyncDirection, SyncOptions, SyncReport, SyncSession,
    SyncState,
};
pub use transaction::Transaction;
pub use watch::{MutationEvent, MutationKind, Subscription, WatchHub, WatchOptions, Watcher};

/// Type aliases for clarity
pub type StoreName = String;
pub type IndexName = String;
pub type SchemaVersion = u32;
