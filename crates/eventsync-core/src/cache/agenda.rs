use tracing::debug;

use crate::models::AgendaSnapshot;
use crate::store::{Collection, Database, StorageError};

/// Per-user agenda snapshots, one record per user.
#[derive(Clone)]
pub struct AgendaCache {
    db: Database,
}

impl AgendaCache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(
        &self,
        user_id: &str,
        attending: Vec<String>,
        interested: Vec<String>,
    ) -> Result<AgendaSnapshot, StorageError> {
        let snapshot = AgendaSnapshot {
            user_id: user_id.to_string(),
            attending,
            interested,
        };
        self.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    pub async fn save_snapshot(&self, snapshot: &AgendaSnapshot) -> Result<(), StorageError> {
        self.db.open().await?.put(Collection::Agenda, snapshot).await?;
        debug!(user_id = %snapshot.user_id, "Cached agenda");
        Ok(())
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<AgendaSnapshot>, StorageError> {
        self.db.open().await?.get(Collection::Agenda, user_id).await
    }

    pub async fn delete(&self, user_id: &str) -> Result<bool, StorageError> {
        self.db.open().await?.delete(Collection::Agenda, user_id).await
    }

    /// Apply `f` to the user's snapshot, starting from an empty one if none is cached.
    ///
    /// Read and write happen in one transaction, so concurrent changes for
    /// the same user are applied one after the other.
    pub async fn modify<F>(&self, user_id: &str, f: F) -> Result<AgendaSnapshot, StorageError>
    where
        F: FnOnce(&mut AgendaSnapshot) + Send + 'static,
    {
        let owner = user_id.to_string();
        let snapshot = self
            .db
            .open()
            .await?
            .update_or_insert(Collection::Agenda, user_id, move || AgendaSnapshot::empty(owner), f)
            .await?;
        debug!(user_id, "Updated cached agenda");
        Ok(snapshot)
    }
}
