//! Durable local store for offline data access.
//!
//! This module provides the versioned, SQLite-backed store that holds one
//! record collection per resource type, the pending-operation queue and
//! per-user agenda snapshots. It survives restarts and never touches the
//! network.
//!
//! - `Store`: a live handle with keyed, full-scan and index-scan access
//! - `Database`: the lazily opened, process-wide handle
//! - `schema`: collections, secondary indexes and the upgrade steps

pub mod database;
pub mod error;
pub mod schema;

pub use database::{Database, IndexValue, Store};
pub use error::StorageError;
pub use schema::{Collection, IndexSpec, SCHEMA_VERSION};
