use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::operation::{
    generate_id, Clock, OperationKind, OperationRequest, OperationStatus, PendingOperation, SystemClock,
};
use crate::models::ResourceKind;
use crate::store::{Collection, Database, StorageError};

/// Attempts at drawing a fresh id before giving up on a key clash.
const MAX_ID_ATTEMPTS: usize = 3;

const TIMESTAMP_INDEX: &str = "by-timestamp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.failed
    }
}

/// The pending-operation queue, persisted in the `pendingOperations` collection.
///
/// Status changes are single read-modify-write transactions, so two callers
/// touching the same operation never lose each other's update.
#[derive(Clone)]
pub struct PendingQueue {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl PendingQueue {
    pub fn new(db: Database) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Persist a new operation with status `pending` and zero retries.
    pub async fn enqueue(&self, request: OperationRequest) -> Result<PendingOperation, StorageError> {
        let store = self.db.open().await?;
        let timestamp = self.clock.now_millis();

        let mut attempt = 1;
        loop {
            let operation = request.clone().into_operation(generate_id(timestamp), timestamp);
            match store.add(Collection::PendingOperations, &operation).await {
                Ok(()) => {
                    info!(
                        op_id = %operation.id,
                        method = %operation.method,
                        endpoint = %operation.endpoint,
                        "Queued operation for later sync"
                    );
                    return Ok(operation);
                }
                Err(StorageError::DuplicateKey { .. }) if attempt < MAX_ID_ATTEMPTS => {
                    warn!(op_id = %operation.id, "Operation id clash, drawing a new one");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Every queued operation, oldest first. This is the replay order.
    pub async fn list_ordered(&self) -> Result<Vec<PendingOperation>, StorageError> {
        self.db
            .open()
            .await?
            .get_all_by_index(Collection::PendingOperations, TIMESTAMP_INDEX)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingOperation>, StorageError> {
        self.db.open().await?.get(Collection::PendingOperations, id).await
    }

    /// Move to `syncing` and count the attempt. Call right before replaying.
    pub async fn mark_syncing(&self, id: &str) -> Result<Option<PendingOperation>, StorageError> {
        let now = self.clock.now_millis();
        self.modify(id, move |op| {
            op.status = OperationStatus::Syncing;
            op.retries += 1;
            op.last_attempt_at = Some(now);
        })
        .await
    }

    /// Move to `failed` with the error text. The operation stays queued.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<Option<PendingOperation>, StorageError> {
        let error = error.to_string();
        self.modify(id, move |op| {
            op.status = OperationStatus::Failed;
            op.error = Some(error);
        })
        .await
    }

    /// Put an operation back to `pending` without touching its retry count.
    pub async fn mark_pending(&self, id: &str) -> Result<Option<PendingOperation>, StorageError> {
        self.modify(id, |op| op.status = OperationStatus::Pending).await
    }

    async fn modify<F>(&self, id: &str, f: F) -> Result<Option<PendingOperation>, StorageError>
    where
        F: FnOnce(&mut PendingOperation) + Send + 'static,
    {
        let updated = self
            .db
            .open()
            .await?
            .update(Collection::PendingOperations, id, f)
            .await?;
        if updated.is_none() {
            debug!(op_id = id, "Status change for unknown operation ignored");
        }
        Ok(updated)
    }

    /// Drop an operation after the server confirmed it.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        self.db.open().await?.delete(Collection::PendingOperations, id).await
    }

    /// Drop an operation unless it is being replayed right now.
    ///
    /// Returns whether it was removed.
    pub async fn cancel(&self, id: &str) -> Result<bool, StorageError> {
        let taken = self
            .db
            .open()
            .await?
            .take_if(Collection::PendingOperations, id, |op: &PendingOperation| {
                op.status != OperationStatus::Syncing
            })
            .await?;
        if let Some(ref op) = taken {
            info!(op_id = %op.id, endpoint = %op.endpoint, "Cancelled queued operation");
        }
        Ok(taken.is_some())
    }

    /// The queued create that holds the provisional record `provisional_key`.
    pub async fn find_created(
        &self,
        resource: ResourceKind,
        provisional_key: &str,
    ) -> Result<Option<PendingOperation>, StorageError> {
        Ok(self.list_ordered().await?.into_iter().find(|op| {
            op.kind == OperationKind::Create
                && op.resource == Some(resource)
                && op.provisional_key.as_deref() == Some(provisional_key)
        }))
    }

    /// Shallow-merge `patch` into an operation's JSON body.
    ///
    /// An operation being replayed is left untouched and comes back with
    /// status `syncing`.
    pub async fn merge_data(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Option<PendingOperation>, StorageError> {
        self.modify(id, move |op| {
            if op.status == OperationStatus::Syncing {
                return;
            }
            let mut fields = match op.data.take() {
                Some(Value::Object(fields)) => fields,
                _ => Map::new(),
            };
            fields.extend(patch);
            op.data = Some(Value::Object(fields));
        })
        .await
    }

    pub async fn clear(&self) -> Result<usize, StorageError> {
        self.db.open().await?.clear(Collection::PendingOperations).await
    }

    /// Remove every operation in `failed` state, returning how many went.
    pub async fn clear_failed(&self) -> Result<usize, StorageError> {
        let store = self.db.open().await?;
        let mut removed = 0;
        for op in self.list_ordered().await?.into_iter().filter(|op| op.is_failed()) {
            if store.delete(Collection::PendingOperations, &op.id).await? {
                removed += 1;
            }
        }
        info!(removed, "Cleared failed operations");
        Ok(removed)
    }

    pub async fn counts(&self) -> Result<QueueCounts, StorageError> {
        let mut counts = QueueCounts::default();
        for op in self.list_ordered().await? {
            match op.status {
                OperationStatus::Pending => counts.pending += 1,
                OperationStatus::Syncing => counts.syncing += 1,
                OperationStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    pub async fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.counts().await?.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{HttpMethod, ManualClock, OperationKind};

    fn queue_at(now: i64) -> (PendingQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (PendingQueue::with_clock(Database::in_memory(), clock.clone()), clock)
    }

    fn request(endpoint: &str) -> OperationRequest {
        OperationRequest::new(OperationKind::Update, endpoint, HttpMethod::Put)
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (queue, _) = queue_at(1_000);
        let op = queue.enqueue(request("/events/e1")).await.unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retries, 0);
        assert_eq!(op.timestamp, 1_000);
        assert!(op.id.starts_with("1000-"));
        assert_eq!(queue.get(&op.id).await.unwrap(), Some(op));
    }

    #[tokio::test]
    async fn test_same_timestamp_keeps_call_order() {
        let (queue, _) = queue_at(7);
        let first = queue.enqueue(request("/a")).await.unwrap();
        let second = queue.enqueue(request("/b")).await.unwrap();
        let ids: Vec<String> = queue.list_ordered().await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_mark_pending_keeps_retries() {
        let (queue, clock) = queue_at(0);
        let op = queue.enqueue(request("/a")).await.unwrap();
        clock.set(500);
        let syncing = queue.mark_syncing(&op.id).await.unwrap().unwrap();
        assert_eq!(syncing.last_attempt_at, Some(500));

        let released = queue.mark_pending(&op.id).await.unwrap().unwrap();
        assert_eq!(released.status, OperationStatus::Pending);
        assert_eq!(released.retries, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let (queue, _) = queue_at(0);
        assert!(queue.mark_syncing("missing").await.unwrap().is_none());
        assert!(queue.mark_failed("missing", "boom").await.unwrap().is_none());
        assert!(!queue.remove("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_failed_and_counts() {
        let (queue, _) = queue_at(0);
        let a = queue.enqueue(request("/a")).await.unwrap();
        let b = queue.enqueue(request("/b")).await.unwrap();
        queue.enqueue(request("/c")).await.unwrap();
        queue.mark_failed(&a.id, "HTTP 500").await.unwrap();
        queue.mark_syncing(&b.id).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts, QueueCounts { pending: 1, syncing: 1, failed: 1 });
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        assert_eq!(queue.clear_failed().await.unwrap(), 1);
        assert_eq!(queue.counts().await.unwrap().total(), 2);
        assert_eq!(queue.clear().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_skips_syncing_operation() {
        let (queue, _) = queue_at(0);
        let idle = queue.enqueue(request("/a")).await.unwrap();
        let busy = queue.enqueue(request("/b")).await.unwrap();
        queue.mark_syncing(&busy.id).await.unwrap();

        assert!(queue.cancel(&idle.id).await.unwrap());
        assert!(!queue.cancel(&busy.id).await.unwrap());
        assert!(!queue.cancel("missing").await.unwrap());
        let ids: Vec<String> = queue.list_ordered().await.unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![busy.id]);
    }

    #[tokio::test]
    async fn test_find_created_and_merge_data() {
        let (queue, _) = queue_at(0);
        queue.enqueue(request("/routes/r1")).await.unwrap();
        let create = queue
            .enqueue(
                OperationRequest::new(OperationKind::Create, "/routes/", HttpMethod::Post)
                    .with_data(serde_json::json!({"name": "a", "distance": "1 km"}))
                    .for_created(ResourceKind::Route, "temp-0-abc"),
            )
            .await
            .unwrap();

        let found = queue.find_created(ResourceKind::Route, "temp-0-abc").await.unwrap();
        assert_eq!(found.map(|o| o.id), Some(create.id.clone()));
        assert!(queue.find_created(ResourceKind::Event, "temp-0-abc").await.unwrap().is_none());

        let Value::Object(patch) = serde_json::json!({"name": "b"}) else { unreachable!() };
        let merged = queue.merge_data(&create.id, patch).await.unwrap().unwrap();
        assert_eq!(merged.data, Some(serde_json::json!({"name": "b", "distance": "1 km"})));

        queue.mark_syncing(&create.id).await.unwrap();
        let Value::Object(late) = serde_json::json!({"name": "c"}) else { unreachable!() };
        let untouched = queue.merge_data(&create.id, late).await.unwrap().unwrap();
        assert_eq!(untouched.status, OperationStatus::Syncing);
        assert_eq!(untouched.data, Some(serde_json::json!({"name": "b", "distance": "1 km"})));
    }
}
