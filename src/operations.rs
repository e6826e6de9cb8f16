//! Operation layer
//!
//! Typed async verbs over the storage engine. Every verb lazily initializes
//! the database (single-flight, see [`Database::init`]), opens a collection
//! handle in the mode it needs, and propagates engine errors unchanged apart
//! from the collection/operation context the handle adds. Engine calls block,
//! so they run on tokio's blocking pool rather than on the async workers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::db::{CollectionHandle, Database, OpenMode};
use crate::error::{Result, StoreError};
use crate::keys::KeyRange;
use crate::metrics;

/// Generic verbs shared by every repository.
#[derive(Debug, Clone)]
pub struct DbOperations {
    db: Arc<Database>,
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

impl DbOperations {
    /// Wraps a shared database.
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The underlying database.
    pub const fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn run<R>(
        &self, collection: &str, operation: &'static str, mode: OpenMode,
        f: impl FnOnce(&CollectionHandle) -> Result<R> + Send + 'static,
    ) -> Result<R>
    where
        R: Send + 'static,
    {
        let started = Instant::now();
        let result = match self.db.init().await.and_then(|()| self.db.collection(collection, mode)) {
            Ok(handle) => tokio::task::spawn_blocking(move || f(&handle))
                .await
                .map_err(StoreError::from)
                .and_then(|result| result),
            Err(err) => Err(err),
        };

        let elapsed = started.elapsed();
        metrics::record_operation(collection, operation, elapsed, result.is_ok());
        match &result {
            Ok(_) => debug!(collection, operation, elapsed_us = elapsed.as_micros(), "Operation completed"),
            Err(err) => warn!(collection, operation, error = %err, "Operation failed"),
        }
        result
    }

    /// Record stored under `key`, if any.
    pub async fn get<T: DeserializeOwned>(&self, collection: &str, key: impl Into<Value> + Send) -> Result<Option<T>> {
        let key = key.into();
        self.run(collection, "get", OpenMode::ReadOnly, move |handle| handle.get(&key))
            .await?
            .map(decode)
            .transpose()
    }

    /// Every record, in engine order, optionally restricted to a primary key range.
    pub async fn get_all<T: DeserializeOwned>(&self, collection: &str, range: Option<KeyRange>) -> Result<Vec<T>> {
        self.run(collection, "getAll", OpenMode::ReadOnly, move |handle| handle.get_all(range.as_ref()))
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Inserts or overwrites `record`. Returns its primary key.
    pub async fn put<T: Serialize + Sync>(&self, collection: &str, record: &T) -> Result<Value> {
        let doc = serde_json::to_value(record)?;
        self.run(collection, "put", OpenMode::ReadWrite, move |handle| handle.put(doc)).await
    }

    /// Inserts `record`; fails with `DuplicateKey` if its key or a unique
    /// index value already exists.
    pub async fn add<T: Serialize + Sync>(&self, collection: &str, record: &T) -> Result<Value> {
        let doc = serde_json::to_value(record)?;
        self.run(collection, "add", OpenMode::ReadWrite, move |handle| handle.add(doc)).await
    }

    /// Deletes the record under `key`. Succeeds when nothing is stored there.
    pub async fn delete(&self, collection: &str, key: impl Into<Value> + Send) -> Result<()> {
        let key = key.into();
        self.run(collection, "delete", OpenMode::ReadWrite, move |handle| handle.delete(&key).map(|_| ()))
            .await
    }

    /// Removes every record in the collection.
    pub async fn clear(&self, collection: &str) -> Result<()> {
        self.run(collection, "clear", OpenMode::ReadWrite, |handle| handle.clear()).await
    }

    /// Number of records, optionally restricted to a primary key range.
    pub async fn count(&self, collection: &str, range: Option<KeyRange>) -> Result<usize> {
        self.run(collection, "count", OpenMode::ReadOnly, move |handle| handle.count(range.as_ref()))
            .await
    }

    /// First record whose `index` value equals `value`.
    pub async fn get_by_index<T: DeserializeOwned>(
        &self, collection: &str, index: &str, value: impl Into<Value> + Send,
    ) -> Result<Option<T>> {
        let (index, value) = (index.to_string(), value.into());
        self.run(collection, "getByIndex", OpenMode::ReadOnly, move |handle| handle.get_by_index(&index, &value))
            .await?
            .map(decode)
            .transpose()
    }

    /// Every record whose `index` value equals `value`.
    pub async fn get_all_by_index<T: DeserializeOwned>(
        &self, collection: &str, index: &str, value: impl Into<Value> + Send,
    ) -> Result<Vec<T>> {
        let (index, value) = (index.to_string(), value.into());
        self.run(collection, "getAllByIndex", OpenMode::ReadOnly, move |handle| {
            handle.get_all_by_index(&index, &value)
        })
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    /// Number of records whose `index` value equals `value`.
    pub async fn count_by_index(&self, collection: &str, index: &str, value: impl Into<Value> + Send) -> Result<usize> {
        let (index, value) = (index.to_string(), value.into());
        self.run(collection, "countByIndex", OpenMode::ReadOnly, move |handle| handle.count_by_index(&index, &value))
            .await
    }
}
