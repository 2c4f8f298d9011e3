//! Opening databases and the top-level handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::{Adapter, Capabilities, Connection, MemoryAdapter};
use crate::schema::{schema_fn, SchemaFn, SchemaSource};
use crate::{
    error::Result, BroadcastTransport, Envelope, Error, MutationEvent, Schema, SchemaBuilder,
    SchemaVersion, StoreAccessor, StoreName, WatchHub,
};

/// Options for [`Database::open`].
///
/// Exactly one of a schema callback or a set of migrations must be given.
#[derive(Clone, Default)]
pub struct OpenOptions {
    version: Option<SchemaVersion>,
    schema: Option<SchemaFn>,
    migrations: BTreeMap<SchemaVersion, SchemaFn>,
    adapter: Option<Arc<dyn Adapter>>,
    broadcast: Option<Arc<dyn BroadcastTransport>>,
}

impl OpenOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target schema version. Defaults to the highest migration, or 1.
    pub fn version(mut self, version: SchemaVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Describe the schema with one callback. It receives the version the
    /// database had before opening (0 when new).
    pub fn schema<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut SchemaBuilder, SchemaVersion) -> Result<()> + Send + Sync + 'static,
    {
        self.schema = Some(schema_fn(f));
        self
    }

    /// Add the migration that upgrades the database to `version`.
    pub fn migration<F>(mut self, version: SchemaVersion, f: F) -> Self
    where
        F: Fn(&mut SchemaBuilder, SchemaVersion) -> Result<()> + Send + Sync + 'static,
    {
        self.migrations.insert(version, schema_fn(f));
        self
    }

    /// Backend to open on. Defaults to [`MemoryAdapter::shared`].
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Share committed changes with other handles through `transport`.
    pub fn broadcast(mut self, transport: Arc<dyn BroadcastTransport>) -> Self {
        self.broadcast = Some(transport);
        self
    }

    fn source(&self) -> Result<SchemaSource> {
        match (&self.schema, self.migrations.is_empty()) {
            (Some(_), false) => Err(Error::Config(
                "provide either a schema callback or migrations, not both".into(),
            )),
            (Some(schema), true) => Ok(SchemaSource::Callback(schema.clone())),
            (None, false) => Ok(SchemaSource::Migrations(self.migrations.clone())),
            (None, true) => Err(Error::Config(
                "a schema callback or at least one migration is required".into(),
            )),
        }
    }
}

impl std::fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenOptions")
            .field("version", &self.version)
            .field("schema", &self.schema.is_some())
            .field("migrations", &self.migrations.keys().collect::<Vec<_>>())
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .field("broadcast", &self.broadcast.is_some())
            .finish()
    }
}

pub(crate) struct DatabaseInner {
    name: String,
    origin: Uuid,
    adapter: Arc<dyn Adapter>,
    conn: Arc<dyn Connection>,
    hub: Arc<WatchHub>,
    broadcast: Option<Arc<dyn BroadcastTransport>>,
    relay: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        if let Some(task) = self.relay.get_mut().take() {
            task.abort();
        }
    }
}

/// An open database. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open (creating or upgrading) the database `name`.
    pub async fn open(name: impl Into<String>, options: OpenOptions) -> Result<Database> {
        let name = name.into();
        let source = options.source()?;
        let version = options
            .version
            .or_else(|| source.inferred_version())
            .unwrap_or(1);
        let adapter = options
            .adapter
            .clone()
            .unwrap_or_else(|| MemoryAdapter::shared() as Arc<dyn Adapter>);

        let existing = adapter.describe(&name).await?;
        let schema = source.resolve(existing.as_ref(), version)?;
        let conn = adapter.open(&name, &schema).await?;

        let hub = WatchHub::new();
        let origin = Uuid::new_v4();
        let relay = match &options.broadcast {
            Some(transport) => Some(spawn_relay(transport.as_ref(), &name, origin, hub.clone())?),
            None => None,
        };

        tracing::info!(
            database = %name,
            version = schema.version,
            adapter = adapter.name(),
            stores = schema.stores.len(),
            "database opened"
        );

        Ok(Database {
            inner: Arc::new(DatabaseInner {
                name,
                origin,
                adapter,
                conn,
                hub,
                broadcast: options.broadcast,
                relay: Mutex::new(relay),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Delete the database `name` and all its data from `adapter`.
    pub async fn destroy(name: &str, adapter: &dyn Adapter) -> Result<()> {
        adapter.destroy(name).await?;
        tracing::info!(database = name, adapter = adapter.name(), "database destroyed");
        Ok(())
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identifier of this handle in broadcast envelopes.
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    /// Schema in effect.
    pub fn schema(&self) -> &Schema {
        self.inner.conn.schema()
    }

    /// Schema version.
    pub fn version(&self) -> SchemaVersion {
        self.schema().version
    }

    /// Names of all stores, sorted.
    pub fn stores(&self) -> Vec<StoreName> {
        self.schema().store_names()
    }

    /// Name of the backend this database runs on.
    pub fn adapter_name(&self) -> &'static str {
        self.inner.adapter.name()
    }

    /// What the backend does natively.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.conn.capabilities()
    }

    /// Access one store.
    pub fn store(&self, name: &str) -> Result<StoreAccessor> {
        self.ensure_open()?;
        let schema = self.schema().store(name)?.clone();
        Ok(StoreAccessor::new(
            self.clone(),
            self.inner.conn.clone(),
            schema,
            None,
        ))
    }

    /// Close the connection and stop receiving broadcasts. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.inner.relay.lock().take() {
            task.abort();
        }
        self.inner.conn.close().await?;
        tracing::info!(database = %self.inner.name, "database closed");
        Ok(())
    }

    /// Whether [`Database::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.conn
    }

    pub(crate) fn hub(&self) -> &Arc<WatchHub> {
        &self.inner.hub
    }

    /// Dispatch a committed event locally and publish it.
    pub(crate) fn emit(&self, event: &MutationEvent) {
        self.inner.hub.dispatch(event);
        if let Some(transport) = &self.inner.broadcast {
            let envelope = Envelope {
                database: self.inner.name.clone(),
                origin: self.inner.origin,
                event: event.clone(),
            };
            if let Err(err) = transport.publish(envelope) {
                tracing::debug!(database = %self.inner.name, error = %err, "broadcast publish failed");
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.version())
            .field("adapter", &self.inner.adapter.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Forward envelopes published by other handles of `name` to local watchers.
fn spawn_relay(
    transport: &dyn BroadcastTransport,
    name: &str,
    origin: Uuid,
    hub: Arc<WatchHub>,
) -> Result<JoinHandle<()>> {
    let mut incoming = transport.subscribe(name)?;
    let name = name.to_string();
    Ok(tokio::spawn(async move {
        while let Some(envelope) = incoming.next().await {
            if envelope.origin == origin || envelope.database != name {
                continue;
            }
            hub.dispatch(&envelope.event);
        }
        tracing::debug!(database = %name, "broadcast stream ended");
    }))
}
