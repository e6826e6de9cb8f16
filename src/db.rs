//! Storage engine
//!
//! Wraps a sled database. Each collection is a sled tree of JSON documents
//! keyed by the encoded primary key, and each secondary index is its own
//! tree. Every single-record write runs as one transaction across the record
//! tree and all index trees of the collection.
//!
//! The engine opens lazily: [`Database::new`] does no I/O and the first
//! [`Database::init`] opens the store, migrating it to the latest schema.
//! Concurrent first callers share a single open.

use serde_json::{Map, Value};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::{Result, StoreError};
use crate::keys::{self, KeyRange};
use crate::metrics;
use crate::schema::{CollectionSpec, IndexSpec, SchemaRegistry, SchemaSnapshot};

const META_TREE: &str = "__meta";
const VERSION_KEY: &[u8] = b"version";
const CATALOG_PREFIX: &str = "catalog/";
const CLOSE_POLL: Duration = Duration::from_millis(5);

/// Transaction mode requested for a collection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only
    ReadOnly,
    /// Reads and writes
    ReadWrite,
}

fn index_tree_name(collection: &str, index: &str) -> String {
    format!("{collection}/idx/{index}")
}

/// Trees backing one collection.
#[derive(Debug)]
struct CollectionState {
    spec: CollectionSpec,
    records: sled::Tree,
    indexes: Vec<(IndexSpec, sled::Tree)>,
    /// Record tree followed by every index tree, in `indexes` order
    all_trees: Vec<sled::Tree>,
}

impl CollectionState {
    fn open(db: &sled::Db, spec: CollectionSpec) -> Result<Self> {
        let records = db.open_tree(&spec.name)?;
        let mut indexes = Vec::with_capacity(spec.indexes.len());
        for index in &spec.indexes {
            let tree = db.open_tree(index_tree_name(&spec.name, &index.name))?;
            indexes.push((index.clone(), tree));
        }

        let mut all_trees = vec![records.clone()];
        all_trees.extend(indexes.iter().map(|(_, tree)| tree.clone()));

        Ok(Self {
            spec,
            records,
            indexes,
            all_trees,
        })
    }
}

/// An open store.
#[derive(Debug)]
struct Connection {
    db: sled::Db,
    version: u32,
    collections: HashMap<String, CollectionState>,
    /// Set by `close()`; handles stop using the connection from then on
    closed: AtomicBool,
}

impl Connection {
    fn open(config: &DatabaseConfig, registry: &SchemaRegistry) -> Result<Self> {
        let mut sled_config = sled::Config::new()
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(config.flush_every_ms);

        if config.temporary {
            sled_config = sled_config.temporary(true);
        } else {
            let path = config.store_path();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            sled_config = sled_config.path(path);
        }

        let db = sled_config
            .open()
            .map_err(|e| StoreError::StorageUnavailable(format!("failed to open store '{}': {e}", config.name)))?;
        let meta = db.open_tree(META_TREE)?;

        let stored_version = read_version(&meta)?;
        let latest_version = registry.latest_version();
        if stored_version > latest_version {
            return Err(StoreError::StorageUnavailable(format!(
                "stored schema version {stored_version} is newer than the latest known version {latest_version}"
            )));
        }

        let mut catalog = load_catalog(&meta)?;

        if stored_version < latest_version {
            info!(from = stored_version, to = latest_version, "Upgrading schema");
            for snapshot in registry.pending(stored_version) {
                apply_snapshot(&db, &meta, &mut catalog, snapshot)?;
            }
            meta.insert(VERSION_KEY, latest_version.to_be_bytes().to_vec())?;
            db.flush()?;
        }

        let mut collections = HashMap::with_capacity(catalog.len());
        for (name, spec) in catalog {
            collections.insert(name, CollectionState::open(&db, spec)?);
        }

        Ok(Self {
            db,
            version: latest_version,
            collections,
            closed: AtomicBool::new(false),
        })
    }
}

fn read_version(meta: &sled::Tree) -> Result<u32> {
    match meta.get(VERSION_KEY)? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::StorageUnavailable("corrupt schema version record".to_string()))?;
            Ok(u32::from_be_bytes(raw))
        },
        None => Ok(0),
    }
}

fn load_catalog(meta: &sled::Tree) -> Result<HashMap<String, CollectionSpec>> {
    let mut catalog = HashMap::new();
    for entry in meta.scan_prefix(CATALOG_PREFIX) {
        let (_, bytes) = entry?;
        let spec: CollectionSpec = bincode::deserialize(&bytes)?;
        catalog.insert(spec.name.clone(), spec);
    }
    Ok(catalog)
}

/// Adds whatever `snapshot` declares that the store does not have yet.
/// Existing collections and indexes are never dropped or recreated.
fn apply_snapshot(
    db: &sled::Db, meta: &sled::Tree, catalog: &mut HashMap<String, CollectionSpec>, snapshot: &SchemaSnapshot,
) -> Result<()> {
    for declared in &snapshot.collections {
        let mut spec = catalog.get(&declared.name).cloned().unwrap_or_else(|| CollectionSpec {
            name: declared.name.clone(),
            primary_key: declared.primary_key.clone(),
            auto_key: declared.auto_key,
            indexes: Vec::new(),
        });
        let is_new = !catalog.contains_key(&declared.name);
        let records = db.open_tree(&declared.name)?;

        let mut changed = is_new;
        for index in &declared.indexes {
            if spec.find_index(&index.name).is_some() {
                continue;
            }
            let tree = db.open_tree(index_tree_name(&declared.name, &index.name))?;
            backfill_index(&records, &tree, index).map_err(|reason| StoreError::Migration {
                version: snapshot.version,
                reason,
            })?;
            spec.indexes.push(index.clone());
            changed = true;
            debug!(collection = %declared.name, index = %index.name, "Created index");
        }

        if changed {
            let key = format!("{CATALOG_PREFIX}{}", spec.name);
            meta.insert(key.as_bytes(), bincode::serialize(&spec)?)?;
            if is_new {
                info!(collection = %spec.name, version = snapshot.version, "Created collection");
            }
            catalog.insert(spec.name.clone(), spec);
        }
    }
    Ok(())
}

fn backfill_index(records: &sled::Tree, tree: &sled::Tree, index: &IndexSpec) -> std::result::Result<(), String> {
    for entry in records.iter() {
        let (primary_key, bytes) = entry.map_err(|e| e.to_string())?;
        let doc: Value = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
        for value in keys::index_values(&doc, index) {
            let entry_key = keys::index_entry_key(&value, &primary_key, index.unique);
            if index.unique {
                if let Some(holder) = tree.get(&entry_key).map_err(|e| e.to_string())? {
                    if holder != primary_key {
                        return Err(format!("unique index '{}' has conflicting values", index.name));
                    }
                }
            }
            tree.insert(entry_key, primary_key.clone()).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

/// Sets `key` at a dotted path, creating intermediate objects.
fn assign_key(doc: &mut Value, path: &str, key: Value) -> Result<()> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidKey("record is not an object".to_string()))?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), key);
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<StoreError>>;

fn abort<T>(err: impl Into<StoreError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err.into()))
}

fn remove_index_entry(view: &TransactionalTree, index: &IndexSpec, value: &[u8], primary_key: &[u8]) -> TxResult<()> {
    let entry_key = keys::index_entry_key(value, primary_key, index.unique);
    if index.unique {
        // Another record may have taken over this value through an upsert
        match view.get(&entry_key)? {
            Some(holder) if holder == primary_key => {
                view.remove(entry_key)?;
            },
            _ => {},
        }
    } else {
        view.remove(entry_key)?;
    }
    Ok(())
}

/// Collection state borrowed from a live connection for one call.
struct Live<'a> {
    db: &'a sled::Db,
    state: &'a CollectionState,
    mode: OpenMode,
}

impl Live<'_> {
    fn name(&self) -> &str {
        &self.state.spec.name
    }

    fn engine(&self, operation: &'static str) -> impl Fn(sled::Error) -> StoreError + '_ {
        move |e| StoreError::engine(self.name(), operation, e)
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(StoreError::ReadOnly(self.name().to_string())),
        }
    }

    fn index(&self, name: &str) -> Result<&(IndexSpec, sled::Tree)> {
        self.state
            .indexes
            .iter()
            .find(|(spec, _)| spec.name == name)
            .ok_or_else(|| StoreError::UnknownIndex {
                collection: self.name().to_string(),
                index: name.to_string(),
            })
    }

    fn decode(bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn get(&self, key: &Value) -> Result<Option<Value>> {
        let encoded = keys::encode_key(key)?;
        self.state
            .records
            .get(encoded)
            .map_err(self.engine("get"))?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    fn get_all(&self, range: Option<&KeyRange>) -> Result<Vec<Value>> {
        let iter = match range {
            None => self.state.records.iter(),
            Some(range) => match range.to_bounds()? {
                Some(bounds) => self.state.records.range(bounds),
                None => return Ok(Vec::new()),
            },
        };

        iter.map(|entry| {
            let (_, bytes) = entry.map_err(self.engine("getAll"))?;
            Self::decode(&bytes)
        })
        .collect()
    }

    fn count(&self, range: Option<&KeyRange>) -> Result<usize> {
        match range {
            None => Ok(self.state.records.len()),
            Some(range) => match range.to_bounds()? {
                Some(bounds) => {
                    let mut count = 0;
                    for entry in self.state.records.range(bounds) {
                        entry.map_err(self.engine("count"))?;
                        count += 1;
                    }
                    Ok(count)
                },
                None => Ok(0),
            },
        }
    }

    fn primary_key(&self, doc: &mut Value) -> Result<Value> {
        let path = &self.state.spec.primary_key;
        if let Some(key) = keys::extract(doc, path).filter(|key| !key.is_null()) {
            return Ok(key.clone());
        }
        if !self.state.spec.auto_key {
            return Err(StoreError::InvalidKey(format!(
                "record in '{}' has no primary key at '{path}'",
                self.name()
            )));
        }

        let generated = Value::from(self.db.generate_id().map_err(self.engine("generateKey"))?);
        assign_key(doc, path, generated.clone())?;
        Ok(generated)
    }

    fn write(&self, mut doc: Value, strict: bool, operation: &'static str) -> Result<Value> {
        self.ensure_writable()?;

        let key = self.primary_key(&mut doc)?;
        let encoded = keys::encode_key(&key)?;
        let bytes = serde_json::to_vec(&doc)?;
        let collection = self.name();

        let result = self.state.all_trees.as_slice().transaction(|views| -> TxResult<()> {
            let records = &views[0];
            let previous = match records.get(&encoded)? {
                Some(_) if strict => {
                    return abort(StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        key: keys::describe(&key),
                    })
                },
                Some(old) => match serde_json::from_slice::<Value>(&old) {
                    Ok(old) => Some(old),
                    Err(e) => return abort(e),
                },
                None => None,
            };

            for (position, (index, _)) in self.state.indexes.iter().enumerate() {
                let view = &views[position + 1];
                let new_values = keys::index_values(&doc, index);

                if let Some(old) = &previous {
                    for stale in keys::index_values(old, index) {
                        if !new_values.contains(&stale) {
                            remove_index_entry(view, index, &stale, &encoded)?;
                        }
                    }
                }

                for value in &new_values {
                    let entry_key = keys::index_entry_key(value, &encoded, index.unique);
                    if index.unique && strict {
                        if let Some(holder) = view.get(&entry_key)? {
                            if holder != encoded.as_slice() {
                                return abort(StoreError::DuplicateKey {
                                    collection: collection.to_string(),
                                    key: format!("{} (index '{}')", keys::describe(&key), index.name),
                                });
                            }
                        }
                    }
                    view.insert(entry_key, encoded.as_slice())?;
                }
            }

            records.insert(encoded.as_slice(), bytes.as_slice())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(key),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(StoreError::engine(collection, operation, err)),
        }
    }

    fn delete(&self, key: &Value) -> Result<bool> {
        self.ensure_writable()?;

        let encoded = keys::encode_key(key)?;
        let collection = self.name();

        let result = self.state.all_trees.as_slice().transaction(|views| -> TxResult<bool> {
            let Some(old) = views[0].remove(encoded.as_slice())? else {
                return Ok(false);
            };
            let old: Value = match serde_json::from_slice(&old) {
                Ok(old) => old,
                Err(e) => return abort(e),
            };

            for (position, (index, _)) in self.state.indexes.iter().enumerate() {
                for value in keys::index_values(&old, index) {
                    remove_index_entry(&views[position + 1], index, &value, &encoded)?;
                }
            }
            Ok(true)
        });

        match result {
            Ok(existed) => Ok(existed),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(StoreError::engine(collection, "delete", err)),
        }
    }

    fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        for tree in &self.state.all_trees {
            tree.clear().map_err(self.engine("clear"))?;
        }
        Ok(())
    }

    fn primary_keys_for(&self, index: &str, value: &Value) -> Result<Vec<sled::IVec>> {
        let (_, tree) = self.index(index)?;
        let prefix = keys::index_prefix(&keys::encode_key(value)?);
        tree.scan_prefix(prefix)
            .map(|entry| entry.map(|(_, primary_key)| primary_key).map_err(self.engine("getAllByIndex")))
            .collect()
    }

    fn get_all_by_index(&self, index: &str, value: &Value) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        for primary_key in self.primary_keys_for(index, value)? {
            // A concurrent delete may land between the index scan and this read
            if let Some(bytes) = self.state.records.get(&primary_key).map_err(self.engine("getAllByIndex"))? {
                results.push(Self::decode(&bytes)?);
            }
        }
        Ok(results)
    }

    fn get_by_index(&self, index: &str, value: &Value) -> Result<Option<Value>> {
        for primary_key in self.primary_keys_for(index, value)? {
            if let Some(bytes) = self.state.records.get(&primary_key).map_err(self.engine("getByIndex"))? {
                return Self::decode(&bytes).map(Some);
            }
        }
        Ok(None)
    }

    fn count_by_index(&self, index: &str, value: &Value) -> Result<usize> {
        Ok(self.primary_keys_for(index, value)?.len())
    }
}

/// Scoped access to one collection, obtained from [`Database::collection`].
///
/// A handle does not keep the store open. Once [`Database::close`] has run,
/// every call on it fails with `NotInitialized`, even after a later `init()`.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    connection: Weak<Connection>,
    name: String,
    mode: OpenMode,
}

impl CollectionHandle {
    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mode the handle was opened with.
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Runs `f` against the connection this handle was taken from, holding it
    /// open for the duration of the call.
    fn live<R>(&self, f: impl FnOnce(&Live<'_>) -> Result<R>) -> Result<R> {
        let connection = self
            .connection
            .upgrade()
            .filter(|connection| !connection.closed.load(Ordering::Acquire))
            .ok_or(StoreError::NotInitialized)?;
        let state = connection
            .collections
            .get(&self.name)
            .ok_or_else(|| StoreError::UnknownCollection(self.name.clone()))?;
        f(&Live {
            db: &connection.db,
            state,
            mode: self.mode,
        })
    }

    /// Fetches the record stored under `key`.
    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        self.live(|live| live.get(key))
    }

    /// Records in primary key order, optionally restricted to `range`.
    pub fn get_all(&self, range: Option<&KeyRange>) -> Result<Vec<Value>> {
        self.live(|live| live.get_all(range))
    }

    /// Number of records, optionally restricted to `range`.
    pub fn count(&self, range: Option<&KeyRange>) -> Result<usize> {
        self.live(|live| live.count(range))
    }

    /// Inserts or replaces a record. Returns its primary key.
    pub fn put(&self, doc: Value) -> Result<Value> {
        self.live(|live| live.write(doc, false, "put"))
    }

    /// Inserts a record, failing with `DuplicateKey` when its primary key or
    /// a unique index value is taken.
    pub fn add(&self, doc: Value) -> Result<Value> {
        self.live(|live| live.write(doc, true, "add"))
    }

    /// Removes the record under `key` and its index entries. Returns whether
    /// a record existed; a missing key is not an error.
    pub fn delete(&self, key: &Value) -> Result<bool> {
        self.live(|live| live.delete(key))
    }

    /// Removes every record and index entry. Not atomic across trees.
    pub fn clear(&self) -> Result<()> {
        self.live(|live| live.clear())
    }

    /// Every record whose `index` value equals `value`, in index order.
    pub fn get_all_by_index(&self, index: &str, value: &Value) -> Result<Vec<Value>> {
        self.live(|live| live.get_all_by_index(index, value))
    }

    /// First record whose `index` value equals `value`.
    pub fn get_by_index(&self, index: &str, value: &Value) -> Result<Option<Value>> {
        self.live(|live| live.get_by_index(index, value))
    }

    /// Number of records whose `index` value equals `value`.
    pub fn count_by_index(&self, index: &str, value: &Value) -> Result<usize> {
        self.live(|live| live.count_by_index(index, value))
    }
}

/// Lazily opened, schema-migrating store.
pub struct Database {
    config: DatabaseConfig,
    registry: Arc<SchemaRegistry>,
    connection: RwLock<Option<Arc<Connection>>>,
    /// Serializes open/close; holds the sticky open failure, if any
    init_gate: Mutex<Option<String>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a database; nothing is opened until [`Database::init`].
    pub fn new(config: DatabaseConfig, registry: SchemaRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            connection: RwLock::new(None),
            init_gate: Mutex::new(None),
        }
    }

    fn read_connection(&self) -> RwLockReadGuard<'_, Option<Arc<Connection>>> {
        self.connection.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connection(&self) -> RwLockWriteGuard<'_, Option<Arc<Connection>>> {
        self.connection.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Result<Arc<Connection>> {
        self.read_connection().clone().ok_or(StoreError::NotInitialized)
    }

    /// True once `init()` has completed and `close()` has not been called since.
    pub fn is_initialized(&self) -> bool {
        self.read_connection().is_some()
    }

    /// Opens the store at the latest schema version, upgrading as needed.
    ///
    /// Idempotent and single-flight: callers arriving while an open is in
    /// progress wait for it instead of opening again. A failed open is
    /// reported to every later caller until [`Database::close`].
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let mut failure = self.init_gate.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        if let Some(reason) = failure.as_ref() {
            return Err(StoreError::StorageUnavailable(reason.clone()));
        }

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let timeout = self.config.open_timeout();
        let task = tokio::task::spawn_blocking(move || Connection::open(&config, &registry));

        let outcome = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StoreError::from(join_error)),
            Err(_) => Err(StoreError::StorageUnavailable(format!(
                "timed out after {}s opening store; another process may hold it",
                timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(connection) => {
                info!(
                    name = %self.config.name,
                    version = connection.version,
                    collections = connection.collections.len(),
                    "Database opened"
                );
                *self.write_connection() = Some(Arc::new(connection));
                metrics::record_open(true);
                Ok(())
            },
            Err(err) => {
                let reason = match err {
                    StoreError::StorageUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                error!(name = %self.config.name, %reason, "Failed to open database");
                *failure = Some(reason.clone());
                metrics::record_open(false);
                Err(StoreError::StorageUnavailable(reason))
            },
        }
    }

    /// Flushes and releases the connection. Safe to call when not open;
    /// also clears a sticky open failure so the next `init()` retries.
    ///
    /// Calls already running on a [`CollectionHandle`] finish first; handles
    /// taken before the close are rejected afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut failure = self.init_gate.lock().await;
        *failure = None;

        let connection = self.write_connection().take();
        if let Some(mut connection) = connection {
            connection.closed.store(true, Ordering::Release);
            let connection = loop {
                match Arc::try_unwrap(connection) {
                    Ok(owned) => break owned,
                    Err(shared) => {
                        connection = shared;
                        tokio::time::sleep(CLOSE_POLL).await;
                    },
                }
            };
            connection.db.flush_async().await?;
            // Dropping the last tree releases the store's file lock
            drop(connection);
            info!(name = %self.config.name, "Database closed");
        }
        Ok(())
    }

    /// Handle on `name`, scoped to `mode`.
    pub fn collection(&self, name: &str, mode: OpenMode) -> Result<CollectionHandle> {
        let connection = self.current()?;
        if !connection.collections.contains_key(name) {
            return Err(StoreError::UnknownCollection(name.to_string()));
        }
        Ok(CollectionHandle {
            connection: Arc::downgrade(&connection),
            name: name.to_string(),
            mode,
        })
    }

    /// Schema version of the open store.
    pub fn version(&self) -> Result<u32> {
        Ok(self.current()?.version)
    }

    /// Names of every collection in the open store, sorted.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.current()?.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Names of the indexes on `collection`, in creation order.
    pub fn index_names(&self, collection: &str) -> Result<Vec<String>> {
        let connection = self.current()?;
        let state = connection
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
        Ok(state.spec.indexes.iter().map(|i| i.name.clone()).collect())
    }
}
