//! Atomic multi-store work.
//!
//! [`Database::transaction`] begins an adapter transaction over the named
//! stores and runs the caller's closure with a [`Transaction`] handle. If the
//! closure returns `Ok`, the transaction commits and buffered change events
//! are dispatched. If it returns `Err` or panics, the transaction rolls back,
//! no events are dispatched, and the error (or panic) reaches the caller
//! unchanged.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::adapter::{Connection, TransactionScope};
use crate::store::PendingEvents;
use crate::{error::Result, Database, Error, StoreAccessor, StoreName};

tokio::task_local! {
    /// Handles with a transaction running on the current task.
    static ACTIVE: Vec<Uuid>;
}

struct TransactionInner {
    db: Database,
    conn: Arc<dyn Connection>,
    stores: Vec<StoreName>,
    pending: PendingEvents,
    finished: AtomicBool,
}

/// Handle passed to a transaction closure.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    /// Access one of the transaction's stores.
    pub fn store(&self, name: &str) -> Result<StoreAccessor> {
        if self.inner.finished.load(Ordering::SeqCst) {
            return Err(Error::TransactionFinished);
        }
        if !self.inner.stores.iter().any(|s| s == name) {
            return Err(Error::StoreNotInTransaction(name.to_string()));
        }
        let schema = self.inner.db.schema().store(name)?.clone();
        Ok(StoreAccessor::new(
            self.inner.db.clone(),
            self.inner.conn.clone(),
            schema,
            Some(self.inner.pending.clone()),
        ))
    }

    /// Stores this transaction covers.
    pub fn stores(&self) -> &[StoreName] {
        &self.inner.stores
    }

    fn finish(&self) -> Vec<crate::MutationEvent> {
        self.inner.finished.store(true, Ordering::SeqCst);
        std::mem::take(&mut *self.inner.pending.lock())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("database", &self.inner.db.name())
            .field("stores", &self.inner.stores)
            .field("finished", &self.inner.finished.load(Ordering::SeqCst))
            .finish()
    }
}

impl Database {
    /// Run `f` atomically over `stores`.
    ///
    /// Starting a transaction on a handle from inside one of its own
    /// transactions fails with [`Error::NestedTransaction`]. Transactions on
    /// backends without native transactions are snapshot+restore and are not
    /// isolated from concurrent writers.
    pub async fn transaction<F, Fut, T, E>(&self, stores: &[&str], f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        self.ensure_open()?;
        let origin = self.origin();
        let active = ACTIVE.try_with(|ids| ids.clone()).unwrap_or_default();
        if active.contains(&origin) {
            return Err(Error::NestedTransaction.into());
        }
        let mut names = Vec::with_capacity(stores.len());
        for store in stores {
            self.schema().store(store)?;
            names.push(store.to_string());
        }

        let scope = self.connection().begin(&names).await?;
        let tx = Transaction {
            inner: Arc::new(TransactionInner {
                db: self.clone(),
                conn: scope.connection(),
                stores: names,
                pending: Arc::new(Mutex::new(Vec::new())),
                finished: AtomicBool::new(false),
            }),
        };
        tracing::debug!(database = %self.name(), stores = ?tx.stores(), "transaction started");

        let handle = tx.clone();
        let mut nested = active;
        nested.push(origin);
        let outcome = ACTIVE
            .scope(nested, AssertUnwindSafe(async move { f(handle).await }).catch_unwind())
            .await;
        let events = tx.finish();

        match outcome {
            Ok(Ok(value)) => {
                scope.commit().await?;
                tracing::debug!(database = %self.name(), events = events.len(), "transaction committed");
                for event in &events {
                    self.emit(event);
                }
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback(scope).await;
                Err(err)
            }
            Err(panic) => {
                self.rollback(scope).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn rollback(&self, scope: Box<dyn TransactionScope>) {
        match scope.rollback().await {
            Ok(()) => tracing::debug!(database = %self.name(), "transaction rolled back"),
            Err(err) => {
                tracing::error!(database = %self.name(), error = %err, "transaction rollback failed")
            }
        }
    }
}
