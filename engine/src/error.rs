//! Error types for the Stow engine.

use thiserror::Error;

use crate::{IndexName, SchemaVersion, StoreName};

/// All possible errors from the Stow engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("store not found: {store} (available stores: {})", available.join(", "))]
    StoreNotFound {
        store: StoreName,
        available: Vec<StoreName>,
    },

    #[error("index not found: {store}.{index}")]
    IndexNotFound { store: StoreName, index: IndexName },

    #[error("version error: requested version {requested} is lower than existing version {existing}")]
    VersionError {
        requested: SchemaVersion,
        existing: SchemaVersion,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    // Data errors
    #[error("unique constraint violated on {store}.{index} for value {key}")]
    Constraint {
        store: StoreName,
        index: IndexName,
        key: String,
    },

    #[error("data error: {0}")]
    DataError(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Transaction errors
    #[error("store '{0}' is not part of this transaction")]
    StoreNotInTransaction(StoreName),

    #[error("a transaction is already active on this database handle")]
    NestedTransaction,

    #[error("transaction has already finished")]
    TransactionFinished,

    // Lifecycle errors
    #[error("cannot {operation} a sync session that is {state}")]
    InvalidSyncState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("connection is closed")]
    Closed,

    // Backend errors
    #[error("{adapter} adapter error: {message}")]
    Backend {
        adapter: &'static str,
        message: String,
    },
}

impl Error {
    /// Build a [`Error::StoreNotFound`] listing the declared stores.
    pub fn store_not_found<'a>(
        store: &str,
        available: impl IntoIterator<Item = &'a StoreName>,
    ) -> Self {
        Error::StoreNotFound {
            store: store.to_string(),
            available: available.into_iter().cloned().collect(),
        }
    }

    /// Build a [`Error::Backend`] for the named adapter.
    pub fn backend(adapter: &'static str, message: impl std::fmt::Display) -> Self {
        Error::Backend {
            adapter,
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::backend("sqlite", err)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
