//! Storage Layer - SQLite-backed persistence
//!
//! One table per entity with an `id` rowid column plus one column per schema
//! field. The connection is created lazily by the stack manager, shared by
//! both contexts, and torn down (file deleted) on clear.

pub mod connection;
pub mod ddl;
pub mod migrate;

pub use connection::StoreConnection;
