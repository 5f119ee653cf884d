use std::marker::PhantomData;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::{Alert, Event, Resource, Route, User, UserRole};
use crate::store::{Collection, Database, IndexValue, StorageError};

pub type EventCache = CacheService<Event>;
pub type AlertCache = CacheService<Alert>;
pub type RouteCache = CacheService<Route>;
pub type UserCache = CacheService<User>;

/// Cache bookkeeping for one resource type.
///
/// Cheap to clone; every clone shares the same lazily opened store.
pub struct CacheService<R> {
    db: Database,
    _resource: PhantomData<fn() -> R>,
}

impl<R> Clone for CacheService<R> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            _resource: PhantomData,
        }
    }
}

impl<R: Resource> CacheService<R> {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            _resource: PhantomData,
        }
    }

    fn collection() -> Collection {
        R::KIND.collection()
    }

    /// Upsert a batch in one transaction. Records missing from the batch are kept.
    pub async fn save_many(&self, records: &[R]) -> Result<usize, StorageError> {
        let saved = self.db.open().await?.put_many(Self::collection(), records).await?;
        debug!(collection = Self::collection().name(), saved, "Cached records");
        Ok(saved)
    }

    pub async fn save_one(&self, record: &R) -> Result<(), StorageError> {
        self.db.open().await?.put(Self::collection(), record).await
    }

    /// Every cached record, in natural index order when the type has one.
    pub async fn get_all(&self) -> Result<Vec<R>, StorageError> {
        let store = self.db.open().await?;
        match R::NATURAL_INDEX {
            Some(index) => store.get_all_by_index(Self::collection(), index).await,
            None => store.get_all(Self::collection()).await,
        }
    }

    pub async fn get_one(&self, key: &str) -> Result<Option<R>, StorageError> {
        self.db.open().await?.get(Self::collection(), key).await
    }

    pub async fn get_by_index(
        &self,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> Result<Vec<R>, StorageError> {
        self.db
            .open()
            .await?
            .get_all_by_index_value(Self::collection(), index, value)
            .await
    }

    pub async fn delete_one(&self, key: &str) -> Result<bool, StorageError> {
        self.db.open().await?.delete(Self::collection(), key).await
    }

    pub async fn clear(&self) -> Result<usize, StorageError> {
        self.db.open().await?.clear(Self::collection()).await
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        self.db.open().await?.count(Self::collection()).await
    }

    /// Store a record under a key that must not be taken yet.
    pub async fn insert(&self, record: &R) -> Result<(), StorageError> {
        self.db.open().await?.add(Self::collection(), record).await
    }

    /// Swap the provisional record `provisional_key` for the server's copy.
    ///
    /// A reply that does not decode as `R` is not stored; the provisional
    /// record stays and `false` is returned.
    pub async fn reconcile(&self, provisional_key: &str, confirmed: &Value) -> Result<bool, StorageError> {
        let record: R = match serde_json::from_value(confirmed.clone()) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    collection = Self::collection().name(),
                    provisional_key,
                    error = %e,
                    "Server reply is not a valid record, keeping provisional copy"
                );
                return Ok(false);
            }
        };
        self.db
            .open()
            .await?
            .replace(Self::collection(), provisional_key, &record)
            .await?;
        debug!(collection = Self::collection().name(), provisional_key, key = record.key(), "Reconciled provisional record");
        Ok(true)
    }

    /// Shallow-merge `patch` into a cached record.
    ///
    /// The key field is never patched. A merge that would no longer decode
    /// as `R` leaves the record as it was. Returns `None` if nothing is cached.
    pub async fn merge(&self, key: &str, patch: Map<String, Value>) -> Result<Option<R>, StorageError> {
        let key_path = Self::collection().key_path();
        self.db
            .open()
            .await?
            .update(Self::collection(), key, move |record: &mut R| {
                let Ok(Value::Object(mut fields)) = serde_json::to_value(&*record) else {
                    return;
                };
                for (field, value) in patch {
                    if field != key_path {
                        fields.insert(field, value);
                    }
                }
                match serde_json::from_value::<R>(Value::Object(fields)) {
                    Ok(merged) => *record = merged,
                    Err(e) => warn!(error = %e, "Patched record no longer decodes, keeping cached copy"),
                }
            })
            .await
    }
}

impl CacheService<Alert> {
    pub async fn active(&self) -> Result<Vec<Alert>, StorageError> {
        self.get_by_index("by-active", true).await
    }

    pub async fn inactive(&self) -> Result<Vec<Alert>, StorageError> {
        self.get_by_index("by-active", false).await
    }
}

impl CacheService<User> {
    pub async fn by_role(&self, role: UserRole) -> Result<Vec<User>, StorageError> {
        self.get_by_index("by-role", role.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn route(id: &str, name: &str) -> Route {
        serde_json::from_value(json!({
            "_id": id,
            "name": name,
            "description": "",
            "category": "cultural",
            "duration": "2 horas",
            "distance": "1 km",
            "difficulty": "facil"
        }))
        .unwrap()
    }

    fn event(id: &str, date: &str) -> Event {
        serde_json::from_value(json!({
            "_id": id,
            "title": id,
            "description": "",
            "date": date,
            "time": "10:00",
            "location": "Parque Calderon",
            "coordinates": {"lat": -2.89, "lng": -79.0},
            "category": "cultural"
        }))
        .unwrap()
    }

    fn user(id: &str, role: &str) -> User {
        serde_json::from_value(json!({"_id": id, "name": id, "email": "x@example.com", "role": role}))
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_many_keeps_stale_entries() {
        let cache = RouteCache::new(Database::in_memory());
        cache.save_many(&[route("r1", "uno"), route("r2", "dos")]).await.unwrap();
        cache.save_many(&[route("r2", "dos bis")]).await.unwrap();

        let all = cache.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(cache.get_one("r2").await.unwrap().unwrap().name, "dos bis");
    }

    #[tokio::test]
    async fn test_events_come_back_by_date() {
        let cache = EventCache::new(Database::in_memory());
        cache
            .save_many(&[event("late", "2025-12-31"), event("early", "2025-01-01")])
            .await
            .unwrap();
        let ids: Vec<String> = cache.get_all().await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_users_by_role() {
        let cache = UserCache::new(Database::in_memory());
        cache
            .save_many(&[user("u1", "user"), user("u2", "admin"), user("u3", "user")])
            .await
            .unwrap();
        let admins = cache.by_role(UserRole::Admin).await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].id, "u2");
        assert_eq!(cache.by_role(UserRole::User).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_patches_fields_but_not_key() {
        let cache = RouteCache::new(Database::in_memory());
        cache.save_one(&route("r1", "old")).await.unwrap();

        let patch = json!({"name": "new", "_id": "other"});
        let Value::Object(patch) = patch else { unreachable!() };
        let merged = cache.merge("r1", patch).await.unwrap().unwrap();
        assert_eq!(merged.id, "r1");
        assert_eq!(merged.name, "new");

        let Value::Object(bad) = json!({"difficulty": "imposible"}) else { unreachable!() };
        let kept = cache.merge("r1", bad).await.unwrap().unwrap();
        assert_eq!(kept.name, "new");
        assert!(cache.merge("nope", Map::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = RouteCache::new(Database::in_memory());
        cache.save_many(&[route("r1", "a"), route("r2", "b")]).await.unwrap();
        assert!(cache.delete_one("r1").await.unwrap());
        assert!(!cache.delete_one("r1").await.unwrap());
        assert_eq!(cache.count().await.unwrap(), 1);
        assert_eq!(cache.clear().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_swaps_provisional_record() {
        let cache = RouteCache::new(Database::in_memory());
        cache.insert(&route("temp-1-abc", "draft")).await.unwrap();

        let confirmed = serde_json::to_value(route("r9", "draft")).unwrap();
        assert!(cache.reconcile("temp-1-abc", &confirmed).await.unwrap());
        assert!(cache.get_one("temp-1-abc").await.unwrap().is_none());
        assert_eq!(cache.get_one("r9").await.unwrap().map(|r| r.name), Some("draft".to_string()));
    }

    #[tokio::test]
    async fn test_reconcile_ignores_malformed_reply() {
        let cache = RouteCache::new(Database::in_memory());
        cache.insert(&route("temp-1-abc", "draft")).await.unwrap();

        let reply = json!({"_id": "r9", "message": "created"});
        assert!(!cache.reconcile("temp-1-abc", &reply).await.unwrap());

        let all = cache.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "temp-1-abc");
    }

    #[tokio::test]
    async fn test_insert_rejects_taken_key() {
        let cache = RouteCache::new(Database::in_memory());
        cache.insert(&route("temp-1-abc", "a")).await.unwrap();
        let clash = cache.insert(&route("temp-1-abc", "b")).await;
        assert!(matches!(clash, Err(StorageError::DuplicateKey { .. })));
        assert_eq!(cache.get_one("temp-1-abc").await.unwrap().map(|r| r.name), Some("a".to_string()));
    }
}
