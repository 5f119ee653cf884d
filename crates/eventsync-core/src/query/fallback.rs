use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::memo::MemoTable;
use super::source::ListSource;
use super::QueryResult;
use crate::cache::CacheService;
use crate::models::Resource;
use crate::store::{Database, StorageError};

/// Network-first listing of one resource type with a cache fallback.
pub struct FallbackQuery<R, S> {
    source: S,
    cache: CacheService<R>,
    memo: MemoTable<(), Vec<R>>,
}

impl<R: Resource, S: ListSource<R>> FallbackQuery<R, S> {
    /// A query that keeps network results fresh for `R::STALE_AFTER`.
    pub fn new(source: S, db: Database) -> Self {
        Self::with_stale_after(source, db, R::STALE_AFTER)
    }

    pub fn with_stale_after(source: S, db: Database, stale_after: Duration) -> Self {
        Self {
            source,
            cache: CacheService::new(db),
            memo: MemoTable::new(stale_after),
        }
    }

    pub fn cache(&self) -> &CacheService<R> {
        &self.cache
    }

    /// Serve the last network result while it is fresh, otherwise refetch.
    pub async fn fetch(&self) -> Result<QueryResult<Vec<R>>, StorageError> {
        if let Some((records, fetched_at)) = self.memo.fresh(&()) {
            debug!(resource = ?R::KIND, "Serving fresh result without a request");
            return Ok(QueryResult::memo(records, fetched_at));
        }
        self.refetch().await
    }

    /// Go to the network now, e.g. when the user comes back to the app.
    pub async fn refetch(&self) -> Result<QueryResult<Vec<R>>, StorageError> {
        match self.source.list().await {
            Ok(records) => {
                let fetched_at = Utc::now();
                if let Err(e) = self.cache.save_many(&records).await {
                    warn!(resource = ?R::KIND, error = %e, "Failed to cache fetched records");
                }
                self.memo.insert((), records.clone(), fetched_at);
                Ok(QueryResult::network(records, fetched_at))
            }
            Err(e) => {
                warn!(resource = ?R::KIND, error = %e, "Fetch failed, serving cached data");
                let cached = self.cache.get_all().await?;
                Ok(QueryResult::cached(cached))
            }
        }
    }

    /// Forget the memoised result so the next `fetch` hits the network.
    pub fn invalidate(&self) {
        self.memo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::models::Alert;
    use crate::query::DataOrigin;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct FakeAlerts {
        down: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ListSource<Alert> for FakeAlerts {
        async fn list(&self) -> Result<Vec<Alert>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(ApiError::ServerError("down".to_string()));
            }
            Ok(vec![alert("a1", true), alert("a2", false)])
        }
    }

    fn alert(id: &str, active: bool) -> Alert {
        serde_json::from_value(json!({
            "_id": id,
            "title": id,
            "description": "",
            "type": "desvio",
            "location": "Av. Solano",
            "coordinates": {"lat": -2.9, "lng": -79.0},
            "start_date": "2025-01-01",
            "end_date": "2025-01-02",
            "is_active": active
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_result_is_not_refetched() {
        let source = FakeAlerts::default();
        let query = FallbackQuery::with_stale_after(source.clone(), Database::in_memory(), Duration::from_secs(60));

        assert_eq!(query.fetch().await.unwrap().origin, DataOrigin::Network);
        let second = query.fetch().await.unwrap();
        assert_eq!(second.origin, DataOrigin::Memo);
        assert_eq!(second.data.len(), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        query.refetch().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        query.invalidate();
        query.fetch().await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_network_result_is_mirrored() {
        let source = FakeAlerts::default();
        let query = FallbackQuery::new(source.clone(), Database::in_memory());
        query.fetch().await.unwrap();

        assert_eq!(query.cache().count().await.unwrap(), 2);
        assert_eq!(query.cache().active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_is_not_memoised() {
        let source = FakeAlerts::default();
        let query = FallbackQuery::with_stale_after(source.clone(), Database::in_memory(), Duration::from_secs(60));
        source.down.store(true, Ordering::SeqCst);

        let offline = query.fetch().await.unwrap();
        assert_eq!(offline.origin, DataOrigin::Cache);
        assert!(offline.data.is_empty());

        source.down.store(false, Ordering::SeqCst);
        let online = query.fetch().await.unwrap();
        assert_eq!(online.origin, DataOrigin::Network);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
