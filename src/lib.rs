//! Highlight Store - Versioned Embedded Document Store
//!
//! Storage for a browser-highlight extension: text captured on web pages,
//! the conversations built around them, messages, page captures and
//! attachments.
//!
//! # Features
//!
//! - Schema registry with ordered, additive migrations
//! - sled-backed collections with unique, multi-entry and compound indexes
//! - Lazy, single-flight open shared by every caller
//! - Typed repositories and cascade delete of conversations
//! - Layered configuration, structured logging and metrics

/// Configuration management
pub mod config;
/// Storage engine: open, migrate and collection handles
pub mod db;
/// Error types
pub mod error;
/// Key encoding and ranges
pub mod keys;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Generic async verbs over the engine
pub mod operations;
/// Repository pattern for data access
pub mod repository;
/// Database schema definitions
pub mod schema;
/// Process-wide facade
pub mod store;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use db::{Database, OpenMode};
pub use error::{Result, StoreError};
pub use keys::KeyRange;
pub use operations::DbOperations;
pub use repository::{CascadeTarget, ConversationScoped, Repository};
pub use schema::{SchemaRegistry, SchemaSnapshot};
pub use store::HighlightStore;
