//! Physical layout of the local store and its versioned upgrade path.
//!
//! Every collection is a table with a `key` primary key, the JSON record in
//! `value`, and one column per secondary index. Index columns are filled
//! from the JSON with `json_extract` on every write, so an index can never
//! disagree with the record it was derived from.
//!
//! Upgrades are additive. Each step creates what it introduces only if it
//! is missing, which keeps steps safe to re-run after an interrupted open.

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use super::error::StorageError;

/// Current schema version of the store.
pub const SCHEMA_VERSION: u32 = 4;

/// A secondary index over one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    /// Logical name, e.g. `by-date`.
    pub name: &'static str,
    /// Column holding the derived index value.
    pub column: &'static str,
    /// Top-level JSON field the index is derived from.
    pub field: &'static str,
}

impl IndexSpec {
    fn json_path(&self) -> String {
        format!("$.{}", self.field)
    }
}

pub const EVENTS_BY_DATE: IndexSpec = IndexSpec {
    name: "by-date",
    column: "by_date",
    field: "date",
};

pub const ALERTS_BY_ACTIVE: IndexSpec = IndexSpec {
    name: "by-active",
    column: "by_active",
    field: "is_active",
};

pub const USERS_BY_ROLE: IndexSpec = IndexSpec {
    name: "by-role",
    column: "by_role",
    field: "role",
};

pub const OPERATIONS_BY_TIMESTAMP: IndexSpec = IndexSpec {
    name: "by-timestamp",
    column: "by_timestamp",
    field: "timestamp",
};

/// Named record collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Events,
    Alerts,
    Routes,
    Users,
    PendingOperations,
    Agenda,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Events,
        Collection::Alerts,
        Collection::Routes,
        Collection::Users,
        Collection::PendingOperations,
        Collection::Agenda,
    ];

    /// Collection name, also used as the table name.
    pub fn name(&self) -> &'static str {
        match self {
            Collection::Events => "events",
            Collection::Alerts => "alerts",
            Collection::Routes => "routes",
            Collection::Users => "users",
            Collection::PendingOperations => "pendingOperations",
            Collection::Agenda => "agenda",
        }
    }

    /// JSON field holding the primary key of each record.
    pub fn key_path(&self) -> &'static str {
        match self {
            Collection::PendingOperations => "id",
            Collection::Agenda => "userId",
            _ => "_id",
        }
    }

    pub fn indexes(&self) -> &'static [IndexSpec] {
        match self {
            Collection::Events => &[EVENTS_BY_DATE],
            Collection::Alerts => &[ALERTS_BY_ACTIVE],
            Collection::Users => &[USERS_BY_ROLE],
            Collection::PendingOperations => &[OPERATIONS_BY_TIMESTAMP],
            Collection::Routes | Collection::Agenda => &[],
        }
    }

    pub fn index(&self, name: &str) -> Option<&'static IndexSpec> {
        self.indexes().iter().find(|index| index.name == name)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One additive upgrade step, applied when moving from `version - 1` to `version`.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub collections: &'static [Collection],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "events cache",
        collections: &[Collection::Events],
    },
    Migration {
        version: 2,
        description: "pending operation queue",
        collections: &[Collection::PendingOperations],
    },
    Migration {
        version: 3,
        description: "alerts, routes and users caches",
        collections: &[Collection::Alerts, Collection::Routes, Collection::Users],
    },
    Migration {
        version: 4,
        description: "per-user agenda snapshots",
        collections: &[Collection::Agenda],
    },
];

pub(crate) fn stored_version(conn: &Connection) -> Result<u32, StorageError> {
    conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
        .map_err(|source| StorageError::Migration { version: 0, source })
}

/// Brings the store up to `target`, applying every intermediate step in order.
pub(crate) fn upgrade(conn: &mut Connection, target: u32) -> Result<u32, StorageError> {
    let stored = stored_version(conn)?;
    if stored > target {
        return Err(StorageError::VersionDowngrade {
            stored,
            requested: target,
        });
    }
    if stored == target {
        debug!(version = stored, "Store schema is up to date");
        return Ok(stored);
    }

    info!(from = stored, to = target, "Upgrading store schema");
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > stored && m.version <= target)
    {
        let version = migration.version;
        let wrap = |source| StorageError::Migration { version, source };

        let tx = conn.transaction().map_err(wrap)?;
        for collection in migration.collections {
            ensure_collection(&tx, *collection).map_err(wrap)?;
        }
        tx.pragma_update(None, "user_version", version).map_err(wrap)?;
        tx.commit().map_err(wrap)?;

        debug!(version, description = migration.description, "Applied schema step");
    }
    Ok(target)
}

fn ensure_collection(tx: &Transaction<'_>, collection: Collection) -> rusqlite::Result<()> {
    let table = collection.name();
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );"
    ))?;

    for index in collection.indexes() {
        ensure_index(tx, table, index)?;
    }
    Ok(())
}

fn ensure_index(tx: &Transaction<'_>, table: &str, index: &IndexSpec) -> rusqlite::Result<()> {
    if !column_exists(tx, table, index.column)? {
        tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {};", index.column))?;
        // Records written before the index existed get their value now.
        tx.execute(
            &format!("UPDATE {table} SET {} = json_extract(value, ?1)", index.column),
            [index.json_path()],
        )?;
    }
    tx.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_{column} ON {table} ({column});",
        column = index.column
    ))
}

fn column_exists(tx: &Transaction<'_>, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Tables currently present, in creation order.
pub(crate) fn existing_collections(conn: &Connection) -> rusqlite::Result<Vec<Collection>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY rowid")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut collections = Vec::new();
    for name in names {
        if let Some(collection) = Collection::from_name(&name?) {
            collections.push(collection);
        }
    }
    Ok(collections)
}
