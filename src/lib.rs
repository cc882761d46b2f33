//! # Duostore - Dual-Context Embedded Object Store
//!
//! A thin, local, single-process persistence stack over SQLite.
//!
//! Duostore provides:
//! - A [`StackManager`] that owns one schema, one store location, and one
//!   storage connection, and hands out two coordinated working contexts
//! - A foreground context attached directly to the store and a background
//!   context layered on top of it
//! - Cascade-up save: saving the background context pushes its pending
//!   changes into the foreground context and on to disk
//! - A typed operations facade (insert, count, fetch, delete, save) keyed by
//!   entity types rather than entity-name strings
//!
//! Schemas are described in TOML, loaded once at configure time, and turned
//! into SQLite tables on first context access. Clearing the manager deletes
//! the whole store directory (write-ahead log and shared-memory side files
//! included) and rebuilds it lazily on next use.

pub mod context;
pub mod entity;
pub mod manager;
pub mod ops;
pub mod query;
pub mod schema;
pub mod store;

// Re-exports for convenient access
pub use context::ContextHandle;
pub use entity::{Entity, Record, RecordId, Value};
pub use manager::{StackConfig, StackManager};
pub use query::{FetchOptions, Filter, SortBy};
pub use schema::{EntityDef, FieldDef, FieldKind, Schema};

/// Result type alias for Duostore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Duostore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema parse error: {0}")]
    SchemaParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema file not found: {0}")]
    SchemaNotFound(std::path::PathBuf),

    #[error("Invalid schema: {0}")]
    SchemaInvalid(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown field {field} on entity {entity}")]
    UnknownField { entity: String, field: String },

    #[error("Field {field} holds a {actual} value, expected {expected}")]
    ValueMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Manager is not configured - call configure() before requesting a context")]
    Unconfigured,

    #[error("Manager is unusable after a fatal store failure: {0}")]
    Unusable(String),

    #[error("Context was invalidated by clear()")]
    ContextInvalidated,
}
