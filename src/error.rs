//! Error types for the highlight store.
//!
//! Every failure the storage stack can report is a variant of [`StoreError`].
//! Absent records are not errors: `get` returns `None` and `delete` of a
//! missing key succeeds.

use thiserror::Error;

/// Errors that can occur while opening or operating on the store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying engine refused to open (locked, corrupt, newer on-disk
    /// version, or the open timed out). Sticky until the engine is closed.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A collection handle was requested before `init()` completed
    #[error("Database not initialized. Call init() first.")]
    NotInitialized,

    /// The collection was never declared in any applied schema snapshot
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// The index was never declared on the collection
    #[error("Unknown index '{index}' on collection '{collection}'")]
    UnknownIndex {
        /// Collection the lookup targeted
        collection: String,
        /// Index name that was not found
        index: String,
    },

    /// The primary key or a unique index value is already taken
    #[error("Duplicate key in '{collection}': {key}")]
    DuplicateKey {
        /// Collection the write targeted
        collection: String,
        /// Human readable form of the conflicting key
        key: String,
    },

    /// A write was attempted through a read-only collection handle
    #[error("Collection '{0}' was opened read-only")]
    ReadOnly(String),

    /// The record has no usable primary key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The schema registry was built from an inconsistent snapshot list
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Applying a schema snapshot failed
    #[error("Schema migration to version {version} failed: {reason}")]
    Migration {
        /// Snapshot version being applied
        version: u32,
        /// What went wrong
        reason: String,
    },

    /// An engine error wrapped with the collection and verb that hit it
    #[error("{operation} on '{collection}' failed: {source}")]
    Engine {
        /// Collection the operation targeted
        collection: String,
        /// Operation kind (get, put, delete, ...)
        operation: &'static str,
        /// The engine's native error
        #[source]
        source: sled::Error,
    },

    /// Raw engine errors outside a collection operation (open, flush, meta)
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Record (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catalog (de)serialization errors
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input rejected by validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Result with `StoreError`
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Wraps an engine error with the collection and operation that produced it.
    #[must_use]
    pub fn engine(collection: &str, operation: &'static str, source: sled::Error) -> Self {
        Self::Engine {
            collection: collection.to_string(),
            operation,
            source,
        }
    }

    /// True for the caller-recoverable duplicate key condition.
    #[must_use]
    pub const fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Other(format!("background task failed: {err}"))
    }
}
