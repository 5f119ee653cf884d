use thiserror::Error;

/// Failures of the durable store.
///
/// These are never swallowed inside the store: the caller decides whether
/// an operation failure is surfaced or absorbed.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Storage error in {collection}: {source}")]
    Sqlite {
        collection: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to encode or decode a {collection} record: {source}")]
    Serialization {
        collection: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record for {collection} has no string key at '{key_path}'")]
    MissingKey {
        collection: &'static str,
        key_path: &'static str,
    },

    #[error("Collection {collection} has no index named '{index}'")]
    UnknownIndex {
        collection: &'static str,
        index: String,
    },

    #[error("Key '{key}' already exists in {collection}")]
    DuplicateKey { collection: &'static str, key: String },

    #[error("Store is at schema version {stored}, cannot open at older version {requested}")]
    VersionDowngrade { stored: u32, requested: u32 },

    #[error("Schema migration to version {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub(crate) fn sqlite(collection: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| StorageError::Sqlite { collection, source }
    }

    pub(crate) fn serde(collection: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| StorageError::Serialization { collection, source }
    }
}
