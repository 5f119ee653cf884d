use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::error::StorageError;
use super::schema::{self, Collection, IndexSpec, SCHEMA_VERSION};

/// Process-wide lazily opened handle, see [`Database::shared`].
static SHARED: OnceLock<Database> = OnceLock::new();

/// Value looked up in a secondary index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::Text(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Integer(value)
    }
}

/// Booleans are indexed as 0/1, matching how SQLite extracts JSON `true`/`false`.
impl From<bool> for IndexValue {
    fn from(value: bool) -> Self {
        IndexValue::Integer(i64::from(value))
    }
}

impl ToSql for IndexValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            IndexValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            IndexValue::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            IndexValue::Real(r) => ToSqlOutput::Owned(SqlValue::Real(*r)),
        })
    }
}

/// Acquire the connection lock, recovering it if a previous holder panicked.
fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Store mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

struct StoreInner {
    conn: Mutex<Connection>,
    version: u32,
}

/// A live handle to the durable store.
///
/// Cheap to clone. All operations are async; the SQLite work itself runs on
/// the blocking pool, one statement batch at a time.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// One encoded record ready to be written.
struct Encoded {
    key: String,
    json: String,
}

impl Store {
    /// Open (creating if needed) the store file at the current schema version.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_at(path, SCHEMA_VERSION).await
    }

    /// Open the store file and upgrade it to `version`.
    pub async fn open_at(path: impl Into<PathBuf>, version: u32) -> Result<Self, StorageError> {
        let path = path.into();
        let conn = tokio::task::spawn_blocking(move || open_file(&path, version))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??;
        Ok(Self::from_connection(conn, version))
    }

    /// A throwaway store that lives only as long as the handle.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let mut conn = Connection::open_in_memory().map_err(|source| StorageError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        schema::upgrade(&mut conn, SCHEMA_VERSION)?;
        Ok(Self::from_connection(conn, SCHEMA_VERSION))
    }

    fn from_connection(conn: Connection, version: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                version,
            }),
        }
    }

    /// Schema version this handle was opened at.
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    async fn with_conn<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = acquire_lock(&inner.conn);
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Collections present in the store file.
    pub async fn collections(&self) -> Result<Vec<Collection>, StorageError> {
        self.with_conn(|conn| {
            schema::existing_collections(conn).map_err(StorageError::sqlite("sqlite_master"))
        })
        .await
    }

    /// Upsert one record by its primary key.
    pub async fn put<T: Serialize>(&self, collection: Collection, record: &T) -> Result<(), StorageError> {
        let encoded = encode(collection, record)?;
        self.with_conn(move |conn| {
            write_one(conn, collection, &encoded, false)
        })
        .await
    }

    /// Upsert many records in a single transaction: all are written or none are.
    pub async fn put_many<T: Serialize>(
        &self,
        collection: Collection,
        records: &[T],
    ) -> Result<usize, StorageError> {
        let encoded = records
            .iter()
            .map(|record| encode(collection, record))
            .collect::<Result<Vec<_>, _>>()?;
        if encoded.is_empty() {
            return Ok(0);
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StorageError::sqlite(collection.name()))?;
            for record in &encoded {
                write_one(&tx, collection, record, false)?;
            }
            tx.commit().map_err(StorageError::sqlite(collection.name()))?;
            debug!(collection = collection.name(), count = encoded.len(), "Wrote records");
            Ok(encoded.len())
        })
        .await
    }

    /// Insert a record whose key must not exist yet.
    pub async fn add<T: Serialize>(&self, collection: Collection, record: &T) -> Result<(), StorageError> {
        let encoded = encode(collection, record)?;
        self.with_conn(move |conn| write_one(conn, collection, &encoded, true))
            .await
    }

    /// Fetch one record. Absence is `Ok(None)`, never an error.
    pub async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let key = key.to_string();
        let json = self
            .with_conn(move |conn| read_value(conn, collection, &key))
            .await?;
        json.map(|json| decode(collection, &json)).transpose()
    }

    /// Every record of the collection in primary-key order.
    pub async fn get_all<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StorageError> {
        let sql = format!("SELECT value FROM {} ORDER BY key", collection.name());
        self.query_values(collection, sql, Vec::new()).await
    }

    /// Every record of the collection ordered by the named index, ties in insertion order.
    pub async fn get_all_by_index<T: DeserializeOwned>(
        &self,
        collection: Collection,
        index: &str,
    ) -> Result<Vec<T>, StorageError> {
        let spec = lookup_index(collection, index)?;
        let sql = format!(
            "SELECT value FROM {} ORDER BY {}, rowid",
            collection.name(),
            spec.column
        );
        self.query_values(collection, sql, Vec::new()).await
    }

    /// Records whose index value equals `value`, in insertion order.
    pub async fn get_all_by_index_value<T: DeserializeOwned>(
        &self,
        collection: Collection,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> Result<Vec<T>, StorageError> {
        let spec = lookup_index(collection, index)?;
        let sql = format!(
            "SELECT value FROM {} WHERE {} = ?1 ORDER BY rowid",
            collection.name(),
            spec.column
        );
        self.query_values(collection, sql, vec![value.into()]).await
    }

    async fn query_values<T: DeserializeOwned>(
        &self,
        collection: Collection,
        sql: String,
        args: Vec<IndexValue>,
    ) -> Result<Vec<T>, StorageError> {
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(StorageError::sqlite(collection.name()))?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args.iter()), |row| row.get::<_, String>(0))
                    .map_err(StorageError::sqlite(collection.name()))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(StorageError::sqlite(collection.name()))?;
                Ok(rows)
            })
            .await?;

        rows.iter().map(|json| decode(collection, json)).collect()
    }

    /// Atomically read, modify and write back one record.
    ///
    /// Returns the updated record, or `None` without writing if the key is absent.
    pub async fn update<T, F>(
        &self,
        collection: Collection,
        key: &str,
        f: F,
    ) -> Result<Option<T>, StorageError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(&mut T) + Send + 'static,
    {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StorageError::sqlite(collection.name()))?;
            let Some(json) = read_value(&tx, collection, &key)? else {
                return Ok(None);
            };
            let mut record: T = decode(collection, &json)?;
            f(&mut record);

            let encoded = encode(collection, &record)?;
            if encoded.key != key {
                // Re-keying inside an update would orphan the old row.
                return Err(StorageError::MissingKey {
                    collection: collection.name(),
                    key_path: collection.key_path(),
                });
            }
            write_one(&tx, collection, &encoded, false)?;
            tx.commit().map_err(StorageError::sqlite(collection.name()))?;
            Ok(Some(record))
        })
        .await
    }

    /// Like [`update`](Self::update), but starts from `default()` when the key
    /// is absent. The read and the write share one transaction.
    pub async fn update_or_insert<T, D, F>(
        &self,
        collection: Collection,
        key: &str,
        default: D,
        f: F,
    ) -> Result<T, StorageError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        D: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut T) + Send + 'static,
    {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StorageError::sqlite(collection.name()))?;
            let mut record: T = match read_value(&tx, collection, &key)? {
                Some(json) => decode(collection, &json)?,
                None => default(),
            };
            f(&mut record);

            let encoded = encode(collection, &record)?;
            if encoded.key != key {
                return Err(StorageError::MissingKey {
                    collection: collection.name(),
                    key_path: collection.key_path(),
                });
            }
            write_one(&tx, collection, &encoded, false)?;
            tx.commit().map_err(StorageError::sqlite(collection.name()))?;
            Ok(record)
        })
        .await
    }

    /// Remove one record if `should_remove` accepts it, returning what was removed.
    ///
    /// The check and the delete share one transaction.
    pub async fn take_if<T, P>(
        &self,
        collection: Collection,
        key: &str,
        should_remove: P,
    ) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned + Send + 'static,
        P: FnOnce(&T) -> bool + Send + 'static,
    {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StorageError::sqlite(collection.name()))?;
            let Some(json) = read_value(&tx, collection, &key)? else {
                return Ok(None);
            };
            let record: T = decode(collection, &json)?;
            if !should_remove(&record) {
                return Ok(None);
            }
            tx.execute(
                &format!("DELETE FROM {} WHERE key = ?1", collection.name()),
                params![key],
            )
            .map_err(StorageError::sqlite(collection.name()))?;
            tx.commit().map_err(StorageError::sqlite(collection.name()))?;
            Ok(Some(record))
        })
        .await
    }

    /// Swap the record stored under `old_key` for `record` in one transaction.
    ///
    /// Used when a provisional key is replaced by the server-assigned one.
    pub async fn replace<T: Serialize>(
        &self,
        collection: Collection,
        old_key: &str,
        record: &T,
    ) -> Result<(), StorageError> {
        let encoded = encode(collection, record)?;
        let old_key = old_key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StorageError::sqlite(collection.name()))?;
            tx.execute(
                &format!("DELETE FROM {} WHERE key = ?1", collection.name()),
                params![old_key],
            )
            .map_err(StorageError::sqlite(collection.name()))?;
            write_one(&tx, collection, &encoded, false)?;
            tx.commit().map_err(StorageError::sqlite(collection.name()))?;
            debug!(collection = collection.name(), from = %old_key, to = %encoded.key, "Replaced record");
            Ok(())
        })
        .await
    }

    /// Remove one record. Returns whether anything was removed; absence is not an error.
    pub async fn delete(&self, collection: Collection, key: &str) -> Result<bool, StorageError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute(
                    &format!("DELETE FROM {} WHERE key = ?1", collection.name()),
                    params![key],
                )
                .map_err(StorageError::sqlite(collection.name()))?;
            Ok(removed > 0)
        })
        .await
    }

    /// Empty the collection, returning how many records were removed.
    pub async fn clear(&self, collection: Collection) -> Result<usize, StorageError> {
        self.with_conn(move |conn| {
            let removed = conn
                .execute(&format!("DELETE FROM {}", collection.name()), [])
                .map_err(StorageError::sqlite(collection.name()))?;
            debug!(collection = collection.name(), removed, "Cleared collection");
            Ok(removed)
        })
        .await
    }

    pub async fn count(&self, collection: Collection) -> Result<usize, StorageError> {
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", collection.name()), [], |row| {
                    row.get(0)
                })
                .map_err(StorageError::sqlite(collection.name()))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }
}

fn open_file(path: &Path, version: u32) -> Result<Connection, StorageError> {
    let wrap = |source| StorageError::Open {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Task(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
    }

    let mut conn = Connection::open(path).map_err(wrap)?;
    // WAL keeps readers from blocking on the writer; busy_timeout absorbs lock contention.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(wrap)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(wrap)?;
    conn.pragma_update(None, "busy_timeout", 5000).map_err(wrap)?;

    let version = schema::upgrade(&mut conn, version)?;
    info!(path = %path.display(), version, "Store opened");
    Ok(conn)
}

fn lookup_index(collection: Collection, index: &str) -> Result<&'static IndexSpec, StorageError> {
    collection.index(index).ok_or_else(|| StorageError::UnknownIndex {
        collection: collection.name(),
        index: index.to_string(),
    })
}

fn encode<T: Serialize>(collection: Collection, record: &T) -> Result<Encoded, StorageError> {
    let value = serde_json::to_value(record).map_err(StorageError::serde(collection.name()))?;
    let key = value
        .get(collection.key_path())
        .and_then(|k| k.as_str())
        .ok_or(StorageError::MissingKey {
            collection: collection.name(),
            key_path: collection.key_path(),
        })?
        .to_string();
    let json = serde_json::to_string(&value).map_err(StorageError::serde(collection.name()))?;
    Ok(Encoded { key, json })
}

fn decode<T: DeserializeOwned>(collection: Collection, json: &str) -> Result<T, StorageError> {
    serde_json::from_str(json).map_err(StorageError::serde(collection.name()))
}

fn read_value(conn: &Connection, collection: Collection, key: &str) -> Result<Option<String>, StorageError> {
    conn.query_row(
        &format!("SELECT value FROM {} WHERE key = ?1", collection.name()),
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(StorageError::sqlite(collection.name()))
}

/// Write one record, deriving every index column from the stored JSON.
fn write_one(
    conn: &Connection,
    collection: Collection,
    record: &Encoded,
    insert_only: bool,
) -> Result<(), StorageError> {
    let indexes = collection.indexes();
    let mut columns = String::from("key, value");
    let mut values = String::from("?1, ?2");
    let mut updates = String::from("value = excluded.value");
    for index in indexes {
        columns.push_str(&format!(", {}", index.column));
        values.push_str(&format!(", json_extract(?2, '$.{}')", index.field));
        updates.push_str(&format!(", {col} = excluded.{col}", col = index.column));
    }

    let table = collection.name();
    let sql = if insert_only {
        format!("INSERT INTO {table} ({columns}) VALUES ({values})")
    } else {
        format!(
            "INSERT INTO {table} ({columns}) VALUES ({values}) \
             ON CONFLICT(key) DO UPDATE SET {updates}"
        )
    };

    match conn.execute(&sql, params![record.key, record.json]) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if insert_only && err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StorageError::DuplicateKey {
                collection: table,
                key: record.key.clone(),
            })
        }
        Err(source) => Err(StorageError::Sqlite {
            collection: table,
            source,
        }),
    }
}

// ============================================================================
// Lazily opened handle
// ============================================================================

enum Location {
    File(PathBuf),
    Memory,
}

struct DatabaseInner {
    location: Location,
    version: u32,
    store: OnceCell<Store>,
}

/// Lazily opened store handle.
///
/// The first call to [`open`](Self::open) performs schema initialisation;
/// every later (or concurrent) call gets the same [`Store`]. Callers never
/// need their own locking.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_version(path, SCHEMA_VERSION)
    }

    /// A handle that opens the file at a specific schema version.
    pub fn with_version(path: impl Into<PathBuf>, version: u32) -> Self {
        Self::from_location(Location::File(path.into()), version)
    }

    pub fn in_memory() -> Self {
        Self::from_location(Location::Memory, SCHEMA_VERSION)
    }

    fn from_location(location: Location, version: u32) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                location,
                version,
                store: OnceCell::new(),
            }),
        }
    }

    /// The process-wide handle. The path of the first caller wins.
    pub fn shared(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let db = SHARED.get_or_init(|| Database::new(path.clone()));
        if let Location::File(existing) = &db.inner.location {
            if *existing != path {
                debug!(requested = %path.display(), existing = %existing.display(), "Shared store already bound to another path");
            }
        }
        db.clone()
    }

    /// Open the store, running initialisation only once per handle.
    ///
    /// A failed initialisation is not memoised, so a later call retries it.
    pub async fn open(&self) -> Result<Store, StorageError> {
        self.inner
            .store
            .get_or_try_init(|| async {
                match &self.inner.location {
                    Location::File(path) => Store::open_at(path.clone(), self.inner.version).await,
                    Location::Memory => Store::open_in_memory().await,
                }
            })
            .await
            .cloned()
    }

    pub fn is_open(&self) -> bool {
        self.inner.store.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        #[serde(rename = "_id")]
        id: String,
        date: String,
        title: String,
    }

    fn row(id: &str, date: &str, title: &str) -> Row {
        Row {
            id: id.to_string(),
            date: date.to_string(),
            title: title.to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_is_an_upsert() {
        let store = Store::open_in_memory().await.unwrap();
        store.put(Collection::Events, &row("e1", "2025-01-01", "first")).await.unwrap();
        store.put(Collection::Events, &row("e1", "2025-01-02", "second")).await.unwrap();

        let all: Vec<Row> = store.get_all(Collection::Events).await.unwrap();
        assert_eq!(all, vec![row("e1", "2025-01-02", "second")]);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = Store::open_in_memory().await.unwrap();
        let found: Option<Row> = store.get(Collection::Events, "nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(!store.delete(Collection::Routes, "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_index_scan_follows_index_order() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .put_many(
                Collection::Events,
                &[
                    row("a", "2025-03-01", "march"),
                    row("b", "2025-01-01", "january"),
                    row("c", "2025-02-01", "february"),
                ],
            )
            .await
            .unwrap();

        let titles: Vec<String> = store
            .get_all_by_index::<Row>(Collection::Events, "by-date")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["january", "february", "march"]);
    }

    #[tokio::test]
    async fn test_index_follows_updates() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .put(Collection::Alerts, &json!({"_id": "a1", "is_active": true}))
            .await
            .unwrap();
        store
            .put(Collection::Alerts, &json!({"_id": "a1", "is_active": false}))
            .await
            .unwrap();

        let active: Vec<serde_json::Value> = store
            .get_all_by_index_value(Collection::Alerts, "by-active", true)
            .await
            .unwrap();
        let inactive: Vec<serde_json::Value> = store
            .get_all_by_index_value(Collection::Alerts, "by-active", false)
            .await
            .unwrap();
        assert!(active.is_empty());
        assert_eq!(inactive.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_index_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store
            .get_all_by_index::<Row>(Collection::Routes, "by-date")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownIndex { .. }));
    }

    #[tokio::test]
    async fn test_record_without_key_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store
            .put(Collection::Events, &json!({"title": "no id"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { key_path: "_id", .. }));
    }

    #[tokio::test]
    async fn test_batch_with_bad_record_writes_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let batch = vec![json!({"_id": "ok"}), json!({"missing": "key"})];
        assert!(store.put_many(Collection::Routes, &batch).await.is_err());
        assert_eq!(store.count(Collection::Routes).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate() {
        let store = Store::open_in_memory().await.unwrap();
        let op = json!({"id": "1-a", "timestamp": 1});
        store.add(Collection::PendingOperations, &op).await.unwrap();
        let err = store.add(Collection::PendingOperations, &op).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_update_modifies_in_place() {
        let store = Store::open_in_memory().await.unwrap();
        store.put(Collection::Events, &row("e1", "2025-01-01", "old")).await.unwrap();

        let updated = store
            .update(Collection::Events, "e1", |r: &mut Row| r.title = "new".to_string())
            .await
            .unwrap();
        assert_eq!(updated.map(|r| r.title), Some("new".to_string()));

        let missing = store
            .update(Collection::Events, "e2", |r: &mut Row| r.title = "x".to_string())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_update_or_insert_starts_from_default() {
        let store = Store::open_in_memory().await.unwrap();

        let created: Row = store
            .update_or_insert(
                Collection::Events,
                "e1",
                || row("e1", "2025-01-01", "draft"),
                |r: &mut Row| r.title.push_str("-1"),
            )
            .await
            .unwrap();
        assert_eq!(created.title, "draft-1");

        let updated: Row = store
            .update_or_insert(
                Collection::Events,
                "e1",
                || row("e1", "2025-01-01", "unused"),
                |r: &mut Row| r.title.push_str("-2"),
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "draft-1-2");
        assert_eq!(store.count(Collection::Events).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_take_if_checks_before_deleting() {
        let store = Store::open_in_memory().await.unwrap();
        store.put(Collection::Events, &row("e1", "2025-01-01", "locked")).await.unwrap();

        let kept: Option<Row> = store
            .take_if(Collection::Events, "e1", |r: &Row| r.title != "locked")
            .await
            .unwrap();
        assert!(kept.is_none());
        assert_eq!(store.count(Collection::Events).await.unwrap(), 1);

        let taken: Option<Row> = store
            .take_if(Collection::Events, "e1", |r: &Row| r.title == "locked")
            .await
            .unwrap();
        assert_eq!(taken.map(|r| r.id), Some("e1".to_string()));
        assert_eq!(store.count(Collection::Events).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_swaps_keys() {
        let store = Store::open_in_memory().await.unwrap();
        store.put(Collection::Events, &row("temp-1", "2025-01-01", "draft")).await.unwrap();
        store
            .replace(Collection::Events, "temp-1", &row("e9", "2025-01-01", "confirmed"))
            .await
            .unwrap();

        let draft: Option<Row> = store.get(Collection::Events, "temp-1").await.unwrap();
        let confirmed: Option<Row> = store.get(Collection::Events, "e9").await.unwrap();
        assert!(draft.is_none());
        assert_eq!(confirmed.map(|r| r.title), Some("confirmed".to_string()));
    }

    #[tokio::test]
    async fn test_clear_empties_collection() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .put_many(Collection::Events, &[row("a", "1", "a"), row("b", "2", "b")])
            .await
            .unwrap();
        assert_eq!(store.clear(Collection::Events).await.unwrap(), 2);
        assert_eq!(store.count(Collection::Events).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_database_open_is_memoised() {
        let db = Database::in_memory();
        assert!(!db.is_open());

        let (a, b) = tokio::join!(db.open(), db.open());
        let (a, b) = (a.unwrap(), b.unwrap());
        a.put(Collection::Routes, &json!({"_id": "r1"})).await.unwrap();

        // Both callers share one underlying store.
        assert_eq!(b.count(Collection::Routes).await.unwrap(), 1);
        assert!(db.is_open());
    }
}
