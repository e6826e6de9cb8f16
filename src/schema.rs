//! Schema registry
//!
//! Collections are described declaratively and grouped into versioned
//! snapshots. The storage engine applies every snapshot newer than the
//! on-disk version, in ascending order, and only ever adds collections or
//! indexes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Result, StoreError};

/// Users collection schema
pub mod users {
    /// Collection name
    pub const COLLECTION: &str = "users";
    /// Primary key field
    pub const ID: &str = "id";
    /// Unique email index
    pub const EMAIL: &str = "email";
}

/// Conversations collection schema
pub mod conversations {
    /// Collection name
    pub const COLLECTION: &str = "conversations";
    /// Primary key field
    pub const ID: &str = "id";
    /// Page URL index
    pub const PAGE_URL: &str = "pageUrl";
    /// Last update timestamp index
    pub const LAST_UPDATED: &str = "lastUpdated";
}

/// Messages collection schema
pub mod messages {
    /// Collection name
    pub const COLLECTION: &str = "messages";
    /// Primary key field
    pub const ID: &str = "id";
    /// Owning conversation index
    pub const CONVERSATION_ID: &str = "conversationId";
    /// Creation timestamp index
    pub const TIME_CREATED: &str = "timeCreated";
}

/// Page context collection schema
pub mod page_context {
    /// Collection name
    pub const COLLECTION: &str = "pageContext";
    /// Primary key field
    pub const ID: &str = "id";
    /// Owning conversation index
    pub const CONVERSATION_ID: &str = "conversationId";
    /// Active flag index
    pub const IS_ACTIVE: &str = "isActive";
}

/// Highlights collection schema
pub mod highlights {
    /// Collection name
    pub const COLLECTION: &str = "highlights";
    /// Primary key field
    pub const ID: &str = "id";
    /// Owning conversation index
    pub const CONVERSATION_ID: &str = "conversationId";
    /// Active flag index
    pub const IS_ACTIVE: &str = "isActive";
    /// Display order index
    pub const ORDER: &str = "order";
}

/// Attachments collection schema
pub mod attachments {
    /// Collection name
    pub const COLLECTION: &str = "attachments";
    /// Primary key field
    pub const ID: &str = "id";
    /// Owning conversation index
    pub const CONVERSATION_ID: &str = "conversationId";
    /// Owning message index
    pub const MESSAGE_ID: &str = "messageId";
    /// Active flag index
    pub const IS_ACTIVE: &str = "isActive";
}

/// UI state collection schema
pub mod ui_state {
    /// Collection name
    pub const COLLECTION: &str = "uiState";
    /// Primary key field
    pub const ID: &str = "id";
    /// One UI state row per conversation
    pub const CONVERSATION_ID: &str = "conversationId";
}

/// Field path (dotted, e.g. `metadata.url`) or a compound list of field paths.
///
/// Externally tagged so the catalog can be stored with `bincode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// A single field path
    Single(String),
    /// A tuple of field paths
    Compound(Vec<String>),
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        Self::Single(path.to_string())
    }
}

impl From<&[&str]> for KeyPath {
    fn from(paths: &[&str]) -> Self {
        Self::Compound(paths.iter().map(ToString::to_string).collect())
    }
}

/// A secondary index on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique within its collection
    pub name: String,
    /// Field path(s) the index is built from
    pub key_path: KeyPath,
    /// Reject two records sharing the same index value
    pub unique: bool,
    /// Index each element of an array value separately
    pub multi_entry: bool,
}

impl IndexSpec {
    /// Non-unique single-entry index.
    pub fn new(name: &str, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.to_string(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Marks the index unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the index multi-entry.
    #[must_use]
    pub const fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// A collection of records sharing a primary key path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection name, stable across versions
    pub name: String,
    /// Field path holding the primary key
    pub primary_key: String,
    /// Generate an integer key when a record has none
    pub auto_key: bool,
    /// Secondary indexes
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    /// Collection keyed by `primary_key` with no indexes yet.
    pub fn new(name: &str, primary_key: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.to_string(),
            auto_key: false,
            indexes: Vec::new(),
        }
    }

    /// Enables generated integer keys.
    #[must_use]
    pub const fn auto_key(mut self) -> Self {
        self.auto_key = true;
        self
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Looks up an index by name.
    pub fn find_index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|idx| idx.name == name)
    }
}

/// One versioned schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Positive, strictly increasing across snapshots
    pub version: u32,
    /// Collections declared (or extended) at this version
    pub collections: Vec<CollectionSpec>,
}

/// Ordered, immutable list of schema snapshots.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    snapshots: Vec<SchemaSnapshot>,
}

impl SchemaRegistry {
    /// Builds a registry, sorting snapshots by version.
    ///
    /// Fails fast on an empty list, a zero version, duplicate versions,
    /// duplicate collection or index names within a snapshot, and a collection
    /// whose primary key changes between snapshots.
    pub fn new(mut snapshots: Vec<SchemaSnapshot>) -> Result<Self> {
        if snapshots.is_empty() {
            return Err(StoreError::InvalidSchema("no schema snapshots declared".to_string()));
        }

        snapshots.sort_by_key(|s| s.version);

        let mut primary_keys: HashMap<&str, (&str, bool)> = HashMap::new();
        for (i, snapshot) in snapshots.iter().enumerate() {
            if snapshot.version == 0 {
                return Err(StoreError::InvalidSchema("schema version must be positive".to_string()));
            }
            if i > 0 && snapshots[i - 1].version == snapshot.version {
                return Err(StoreError::InvalidSchema(format!(
                    "duplicate schema version {}",
                    snapshot.version
                )));
            }

            let mut names = HashSet::new();
            for collection in &snapshot.collections {
                if !names.insert(collection.name.as_str()) {
                    return Err(StoreError::InvalidSchema(format!(
                        "collection '{}' declared twice in version {}",
                        collection.name, snapshot.version
                    )));
                }

                let mut index_names = HashSet::new();
                for index in &collection.indexes {
                    if !index_names.insert(index.name.as_str()) {
                        return Err(StoreError::InvalidSchema(format!(
                            "index '{}' declared twice on '{}'",
                            index.name, collection.name
                        )));
                    }
                }

                let key = (collection.primary_key.as_str(), collection.auto_key);
                if let Some(existing) = primary_keys.insert(collection.name.as_str(), key) {
                    if existing != key {
                        return Err(StoreError::InvalidSchema(format!(
                            "collection '{}' changes its primary key in version {}",
                            collection.name, snapshot.version
                        )));
                    }
                }
            }
        }

        Ok(Self { snapshots })
    }

    /// The highest declared version.
    pub fn latest_version(&self) -> u32 {
        self.snapshots.last().map_or(1, |s| s.version)
    }

    /// All snapshots in ascending version order.
    pub fn snapshots(&self) -> &[SchemaSnapshot] {
        &self.snapshots
    }

    /// Snapshots that still have to be applied on top of `stored_version`.
    pub fn pending(&self, stored_version: u32) -> impl Iterator<Item = &SchemaSnapshot> {
        self.snapshots.iter().filter(move |s| s.version > stored_version)
    }

    /// Names of every collection declared in any snapshot.
    pub fn collection_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.snapshots
            .iter()
            .flat_map(|s| s.collections.iter())
            .filter(|c| seen.insert(c.name.as_str()))
            .map(|c| c.name.as_str())
            .collect()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self { snapshots: all_schemas() }
    }
}

/// Version 1: initial schema.
pub fn schema_v1() -> SchemaSnapshot {
    SchemaSnapshot {
        version: 1,
        collections: vec![
            CollectionSpec::new(users::COLLECTION, users::ID).index(IndexSpec::new(users::EMAIL, users::EMAIL).unique()),
            CollectionSpec::new(conversations::COLLECTION, conversations::ID)
                .index(IndexSpec::new(conversations::PAGE_URL, conversations::PAGE_URL))
                .index(IndexSpec::new(conversations::LAST_UPDATED, conversations::LAST_UPDATED)),
            CollectionSpec::new(messages::COLLECTION, messages::ID)
                .index(IndexSpec::new(messages::CONVERSATION_ID, messages::CONVERSATION_ID))
                .index(IndexSpec::new(messages::TIME_CREATED, messages::TIME_CREATED)),
            CollectionSpec::new(page_context::COLLECTION, page_context::ID)
                .index(IndexSpec::new(page_context::CONVERSATION_ID, page_context::CONVERSATION_ID))
                .index(IndexSpec::new(page_context::IS_ACTIVE, page_context::IS_ACTIVE)),
            CollectionSpec::new(highlights::COLLECTION, highlights::ID)
                .index(IndexSpec::new(highlights::CONVERSATION_ID, highlights::CONVERSATION_ID))
                .index(IndexSpec::new(highlights::IS_ACTIVE, highlights::IS_ACTIVE))
                .index(IndexSpec::new(highlights::ORDER, highlights::ORDER)),
            CollectionSpec::new(attachments::COLLECTION, attachments::ID)
                .index(IndexSpec::new(attachments::CONVERSATION_ID, attachments::CONVERSATION_ID))
                .index(IndexSpec::new(attachments::MESSAGE_ID, attachments::MESSAGE_ID))
                .index(IndexSpec::new(attachments::IS_ACTIVE, attachments::IS_ACTIVE)),
            CollectionSpec::new(ui_state::COLLECTION, ui_state::ID)
                .index(IndexSpec::new(ui_state::CONVERSATION_ID, ui_state::CONVERSATION_ID).unique()),
        ],
    }
}

/// Every schema snapshot, oldest first.
pub fn all_schemas() -> Vec<SchemaSnapshot> {
    vec![schema_v1()]
}
