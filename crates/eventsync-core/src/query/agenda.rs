use tracing::{debug, warn};

use super::source::AgendaSource;
use super::QueryResult;
use crate::cache::AgendaCache;
use crate::models::AgendaSnapshot;
use crate::store::{Database, StorageError};

/// The user's agenda, network-first.
///
/// Not memoised: agenda changes come from this user's own mutations, which
/// update the cached snapshot directly.
pub struct AgendaQuery<S> {
    source: S,
    cache: AgendaCache,
}

impl<S: AgendaSource> AgendaQuery<S> {
    pub fn new(source: S, db: Database) -> Self {
        Self {
            source,
            cache: AgendaCache::new(db),
        }
    }

    /// Fetch the agenda. Offline, the cached snapshot or an empty one.
    pub async fn fetch(&self, user_id: &str) -> Result<QueryResult<AgendaSnapshot>, StorageError> {
        match self.source.get_agenda().await {
            Ok(response) => {
                if response.user_id != user_id {
                    debug!(requested = user_id, returned = %response.user_id, "Agenda user differs from requested user");
                }
                let mut snapshot = AgendaSnapshot::from(response);
                // Cached under the id the caller will look it up by.
                snapshot.user_id = user_id.to_string();
                if let Err(e) = self.cache.save_snapshot(&snapshot).await {
                    warn!(user_id, error = %e, "Failed to cache agenda");
                }
                Ok(QueryResult::network(snapshot, chrono::Utc::now()))
            }
            Err(e) => {
                warn!(user_id, error = %e, "Agenda fetch failed, serving cached agenda");
                let snapshot = self
                    .cache
                    .get(user_id)
                    .await?
                    .unwrap_or_else(|| AgendaSnapshot::empty(user_id));
                Ok(QueryResult::cached(snapshot))
            }
        }
    }
}
