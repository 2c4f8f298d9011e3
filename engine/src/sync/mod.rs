//! Reconciliation between two databases.
//!
//! A [`SyncSession`] keeps the configured stores of a source and a target
//! database converging. Changes travel two ways:
//!
//! - **Push**: the session subscribes to the watch engine of each side and
//!   mirrors every event onto the other side as it happens.
//! - **Pull**: a timer runs [`SyncSession::sync_all`], which diffs both sides
//!   record by record and copies what is missing.
//!
//! Records present on both sides with different content are resolved by a
//! [`ConflictPolicy`]. Writes that would not change the destination are
//! skipped, which is what lets bidirectional echoes die out.
//!
//! # Lifecycle
//!
//! ```text
//! created ──start──▶ started ──pause──▶ paused
//!                      ▲                  │
//!                      └─────resume───────┘
//! (any) ──stop──▶ stopped
//! ```

mod conflict;
mod session;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Key, MutationKind, StoreName};

pub use conflict::{Conflict, ConflictPolicy, Resolution, Resolver};
pub use session::{SyncSession, SyncState};

/// Default period between pull passes.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(30);

/// Which way changes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    /// Source to target only
    Push,
    /// Target to source only
    Pull,
    /// Both ways (default)
    #[default]
    Bidirectional,
}

impl SyncDirection {
    /// Whether the target may be written.
    pub fn pushes(self) -> bool {
        matches!(self, SyncDirection::Push | SyncDirection::Bidirectional)
    }

    /// Whether the source may be written.
    pub fn pulls(self) -> bool {
        matches!(self, SyncDirection::Pull | SyncDirection::Bidirectional)
    }
}

/// Called once per failed apply.
pub type ErrorCallback = Arc<dyn Fn(&SyncApplyError) + Send + Sync>;

/// Configuration for a [`SyncSession`].
#[derive(Clone)]
pub struct SyncOptions {
    /// Stores kept in sync. Must be non-empty and exist on both sides.
    pub stores: Vec<StoreName>,
    /// Which way changes flow
    pub direction: SyncDirection,
    /// How conflicting records are resolved
    pub conflict: ConflictPolicy,
    /// Period of the pull timer
    pub pull_interval: Duration,
    /// Receives every failed apply
    pub on_error: Option<ErrorCallback>,
}

impl SyncOptions {
    /// Options syncing `stores` with every other setting at its default.
    pub fn new<I, S>(stores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StoreName>,
    {
        Self {
            stores: stores.into_iter().map(Into::into).collect(),
            direction: SyncDirection::default(),
            conflict: ConflictPolicy::default(),
            pull_interval: DEFAULT_PULL_INTERVAL,
            on_error: None,
        }
    }

    /// Which way changes flow. Defaults to [`SyncDirection::Bidirectional`].
    pub fn direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    /// How records present on both sides with different values are settled.
    pub fn conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    /// Period of the full pass a pulling session runs while started.
    /// Must be non-zero; defaults to [`DEFAULT_PULL_INTERVAL`].
    pub fn pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Install an error callback.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SyncApplyError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("stores", &self.stores)
            .field("direction", &self.direction)
            .field("conflict", &self.conflict)
            .field("pull_interval", &self.pull_interval)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The step that failed while applying a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Put,
    Delete,
    Clear,
    /// Reading a store during a full pass
    Diff,
}

impl From<MutationKind> for SyncOperation {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Put => SyncOperation::Put,
            MutationKind::Delete => SyncOperation::Delete,
            MutationKind::Clear => SyncOperation::Clear,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncOperation::Put => "put",
            SyncOperation::Delete => "delete",
            SyncOperation::Clear => "clear",
            SyncOperation::Diff => "diff",
        };
        f.write_str(name)
    }
}

/// A change that could not be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("sync {operation} on {store} failed: {error}")]
pub struct SyncApplyError {
    /// Store being synced
    pub store: StoreName,
    /// What was being done
    pub operation: SyncOperation,
    /// Affected key, when there is one
    pub key: Option<Key>,
    /// Underlying failure
    #[source]
    pub error: Error,
}

/// Per-store outcome of a full pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreReport {
    /// Records copied to the side missing them
    pub copied: usize,
    /// Keys whose content differed
    pub conflicts: usize,
    /// Failed applies
    pub errors: usize,
}

/// Outcome of [`SyncSession::sync_all`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Counts per store
    pub stores: BTreeMap<StoreName, StoreReport>,
    /// Every conflict resolved, in store then key order
    pub conflicts: Vec<Conflict>,
}

impl SyncReport {
    /// Records copied across all stores.
    pub fn copied(&self) -> usize {
        self.stores.values().map(|s| s.copied).sum()
    }

    /// Failed applies across all stores.
    pub fn errors(&self) -> usize {
        self.stores.values().map(|s| s.errors).sum()
    }
}
