//! Per-resource cache services over the durable store.
//!
//! Pure bookkeeping: nothing here talks to the network. Records are written
//! as a side effect of successful responses and read back when the network
//! is unavailable.

pub mod agenda;
pub mod service;

pub use agenda::AgendaCache;
pub use service::{AlertCache, CacheService, EventCache, RouteCache, UserCache};

use serde_json::Value;

use crate::models::ResourceKind;
use crate::store::{Database, StorageError};

/// Replace a provisional record with the one the server confirmed.
///
/// Returns `false` when the reply does not decode as the resource, in which
/// case the provisional record is kept.
pub async fn reconcile_created(
    db: &Database,
    kind: ResourceKind,
    provisional_key: &str,
    confirmed: &Value,
) -> Result<bool, StorageError> {
    let db = db.clone();
    match kind {
        ResourceKind::Event => EventCache::new(db).reconcile(provisional_key, confirmed).await,
        ResourceKind::Alert => AlertCache::new(db).reconcile(provisional_key, confirmed).await,
        ResourceKind::Route => RouteCache::new(db).reconcile(provisional_key, confirmed).await,
        ResourceKind::User => UserCache::new(db).reconcile(provisional_key, confirmed).await,
    }
}
