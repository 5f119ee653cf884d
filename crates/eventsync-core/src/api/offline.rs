//! Mutations that fall back to the pending-operation queue when offline.
//!
//! Online, a mutation is sent straight to the server and the confirmed
//! record is cached. When the server cannot be reached the request is
//! queued for replay and the cache is updated optimistically, with created
//! records held under a provisional key until the server confirms them.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ApiClient, ApiError};
use crate::cache::{AgendaCache, CacheService};
use crate::models::{is_provisional_key, provisional_key, AgendaResponse, AgendaSnapshot, Resource};
use crate::queue::operation::generate_id;
use crate::queue::{HttpMethod, OperationKind, OperationRequest, OperationStatus, PendingOperation, PendingQueue};
use crate::store::{Database, StorageError};

#[derive(Error, Debug)]
pub enum MutationError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No queued create for provisional record {0}")]
    UnknownProvisional(String),

    #[error("Provisional record {0} is being sent to the server, try again once it is confirmed")]
    ProvisionalInFlight(String),
}

/// Attempts at drawing a fresh provisional key before giving up on a clash.
const MAX_KEY_ATTEMPTS: usize = 3;

/// What happened to a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    /// The server accepted it.
    Applied(T),
    /// The server was unreachable; the request waits in the queue.
    Queued(PendingOperation),
}

impl<T> MutationOutcome<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued(_))
    }
}

/// Agenda changes for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgendaAction {
    Attend,
    Interest,
    NotGoing,
    Remove,
}

impl AgendaAction {
    fn endpoint(&self, event_id: &str) -> String {
        match self {
            AgendaAction::Attend => format!("/agenda/attending/{}", event_id),
            AgendaAction::Interest => format!("/agenda/interested/{}", event_id),
            AgendaAction::NotGoing => format!("/agenda/not-going/{}", event_id),
            AgendaAction::Remove => format!("/agenda/{}", event_id),
        }
    }

    fn method(&self) -> HttpMethod {
        match self {
            AgendaAction::Remove => HttpMethod::Delete,
            _ => HttpMethod::Post,
        }
    }

    fn kind(&self) -> OperationKind {
        match self {
            AgendaAction::Remove => OperationKind::Delete,
            _ => OperationKind::Update,
        }
    }

    /// The local equivalent of what the server does.
    fn apply(&self, snapshot: &mut AgendaSnapshot, event_id: &str) {
        match self {
            AgendaAction::Attend => snapshot.mark_attending(event_id),
            AgendaAction::Interest => snapshot.mark_interested(event_id),
            AgendaAction::NotGoing | AgendaAction::Remove => snapshot.remove_event(event_id),
        }
    }
}

/// Write client that keeps working without a connection.
#[derive(Clone)]
pub struct OfflineClient {
    api: ApiClient,
    queue: PendingQueue,
    db: Database,
}

impl OfflineClient {
    pub fn new(api: ApiClient, queue: PendingQueue, db: Database) -> Self {
        Self { api, queue, db }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    fn request(&self, kind: OperationKind, endpoint: &str, method: HttpMethod) -> OperationRequest {
        OperationRequest::new(kind, endpoint, method).with_headers(self.api.request_headers())
    }

    /// Create a record at `endpoint` (e.g. `/events/`).
    ///
    /// `payload` must be a complete record without its key.
    pub async fn create<R: Resource>(
        &self,
        endpoint: &str,
        payload: Value,
    ) -> Result<MutationOutcome<R>, MutationError> {
        let fields = require_object(payload)?;
        let body = Value::Object(fields.clone());
        let cache = CacheService::<R>::new(self.db.clone());

        match self.api.send(HttpMethod::Post, endpoint, Some(&body)).await {
            Ok(response) => {
                let record: R = decode_record(response)?;
                cache.save_one(&record).await?;
                Ok(MutationOutcome::Applied(record))
            }
            Err(e) if e.is_offline() => {
                let key = self.cache_provisional(&cache, &fields).await?;

                let op = self
                    .queue
                    .enqueue(
                        self.request(OperationKind::Create, endpoint, HttpMethod::Post)
                            .with_data(body)
                            .for_created(R::KIND, key.clone()),
                    )
                    .await?;
                info!(endpoint, key = %key, "Offline: created record provisionally");
                Ok(MutationOutcome::Queued(op))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Update the record `key` at `endpoint` (e.g. `/events/{key}`) with a partial payload.
    ///
    /// A provisional record has no server copy yet, so its update is merged
    /// into the queued create instead of being sent.
    pub async fn update<R: Resource>(
        &self,
        endpoint: &str,
        key: &str,
        payload: Value,
    ) -> Result<MutationOutcome<R>, MutationError> {
        let fields = require_object(payload)?;
        if is_provisional_key(key) {
            return self.amend_provisional::<R>(key, fields).await;
        }
        let body = Value::Object(fields.clone());
        let cache = CacheService::<R>::new(self.db.clone());

        match self.api.send(HttpMethod::Put, endpoint, Some(&body)).await {
            Ok(response) => {
                let record: R = decode_record(response)?;
                cache.save_one(&record).await?;
                Ok(MutationOutcome::Applied(record))
            }
            Err(e) if e.is_offline() => {
                if cache.merge(key, fields).await?.is_none() {
                    debug!(key, "Offline update for a record that is not cached");
                }
                let op = self
                    .queue
                    .enqueue(self.request(OperationKind::Update, endpoint, HttpMethod::Put).with_data(body))
                    .await?;
                info!(endpoint, key, "Offline: update queued");
                Ok(MutationOutcome::Queued(op))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the record `key` at `endpoint`.
    ///
    /// Deleting a provisional record cancels its queued create; nothing
    /// reaches the server and the outcome is `Applied`.
    pub async fn delete<R: Resource>(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<MutationOutcome<()>, MutationError> {
        let cache = CacheService::<R>::new(self.db.clone());

        if is_provisional_key(key) {
            if let Some(create) = self.queue.find_created(R::KIND, key).await? {
                if !self.queue.cancel(&create.id).await? && self.queue.get(&create.id).await?.is_some() {
                    return Err(MutationError::ProvisionalInFlight(key.to_string()));
                }
            }
            cache.delete_one(key).await?;
            info!(key, "Discarded provisional record");
            return Ok(MutationOutcome::Applied(()));
        }

        match self.api.send(HttpMethod::Delete, endpoint, None).await {
            Ok(_) => {
                cache.delete_one(key).await?;
                Ok(MutationOutcome::Applied(()))
            }
            Err(e) if e.is_offline() => {
                cache.delete_one(key).await?;
                let op = self
                    .queue
                    .enqueue(self.request(OperationKind::Delete, endpoint, HttpMethod::Delete))
                    .await?;
                info!(endpoint, key, "Offline: delete queued");
                Ok(MutationOutcome::Queued(op))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Change how `user_id` relates to `event_id`.
    pub async fn agenda(
        &self,
        user_id: &str,
        event_id: &str,
        action: AgendaAction,
    ) -> Result<MutationOutcome<AgendaSnapshot>, MutationError> {
        let cache = AgendaCache::new(self.db.clone());
        let endpoint = action.endpoint(event_id);
        let body = match action.method() {
            HttpMethod::Delete => None,
            _ => Some(Value::Object(Map::new())),
        };

        match self.api.send(action.method(), &endpoint, body.as_ref()).await {
            Ok(Some(response)) => {
                let response: AgendaResponse = serde_json::from_value(response)
                    .map_err(|e| ApiError::InvalidResponse(format!("Bad agenda response: {}", e)))?;
                let mut snapshot = AgendaSnapshot::from(response);
                snapshot.user_id = user_id.to_string();
                cache.save_snapshot(&snapshot).await?;
                Ok(MutationOutcome::Applied(snapshot))
            }
            Ok(None) => {
                let event_id = event_id.to_string();
                let snapshot = cache.modify(user_id, move |s| action.apply(s, &event_id)).await?;
                Ok(MutationOutcome::Applied(snapshot))
            }
            Err(e) if e.is_offline() => {
                let owned_id = event_id.to_string();
                cache.modify(user_id, move |s| action.apply(s, &owned_id)).await?;

                let mut request = self.request(action.kind(), &endpoint, action.method());
                if let Some(body) = body {
                    request = request.with_data(body);
                }
                let op = self.queue.enqueue(request).await?;
                info!(user_id, event_id, ?action, "Offline: agenda change queued");
                Ok(MutationOutcome::Queued(op))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl OfflineClient {
    /// Cache `fields` under a fresh provisional key and return the key.
    async fn cache_provisional<R: Resource>(
        &self,
        cache: &CacheService<R>,
        fields: &Map<String, Value>,
    ) -> Result<String, MutationError> {
        let key_path = R::KIND.collection().key_path();
        let mut attempt = 1;
        loop {
            let key = provisional_key(&generate_id(self.queue.now_millis()));
            let mut local = fields.clone();
            local.insert(key_path.to_string(), Value::String(key.clone()));
            let record: R = serde_json::from_value(Value::Object(local))
                .map_err(|e| MutationError::InvalidPayload(e.to_string()))?;

            match cache.insert(&record).await {
                Ok(()) => return Ok(key),
                Err(StorageError::DuplicateKey { .. }) if attempt < MAX_KEY_ATTEMPTS => {
                    warn!(key = %key, "Provisional key clash, drawing a new one");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fold an update of a provisional record into its queued create.
    async fn amend_provisional<R: Resource>(
        &self,
        key: &str,
        mut patch: Map<String, Value>,
    ) -> Result<MutationOutcome<R>, MutationError> {
        patch.remove(R::KIND.collection().key_path());
        let create = self
            .queue
            .find_created(R::KIND, key)
            .await?
            .ok_or_else(|| MutationError::UnknownProvisional(key.to_string()))?;

        let amended = self
            .queue
            .merge_data(&create.id, patch.clone())
            .await?
            .ok_or_else(|| MutationError::UnknownProvisional(key.to_string()))?;
        if amended.status == OperationStatus::Syncing {
            return Err(MutationError::ProvisionalInFlight(key.to_string()));
        }

        CacheService::<R>::new(self.db.clone()).merge(key, patch).await?;
        info!(key, op_id = %amended.id, "Folded update into queued create");
        Ok(MutationOutcome::Queued(amended))
    }
}

fn require_object(payload: Value) -> Result<Map<String, Value>, MutationError> {
    match payload {
        Value::Object(fields) => Ok(fields),
        other => Err(MutationError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn decode_record<R: Resource>(response: Option<Value>) -> Result<R, ApiError> {
    let body = response.ok_or_else(|| ApiError::InvalidResponse("Empty response body".to_string()))?;
    serde_json::from_value(body)
        .map_err(|e| ApiError::InvalidResponse(format!("Unexpected {:?} record: {}", R::KIND, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Route;
    use serde_json::json;

    fn offline_client() -> OfflineClient {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let db = Database::in_memory();
        let api = ApiClient::new(format!("http://127.0.0.1:{}/api/v1", port)).unwrap();
        OfflineClient::new(api, PendingQueue::new(db.clone()), db)
    }

    #[tokio::test]
    async fn test_non_object_payload_is_rejected() {
        let client = offline_client();
        let err = client.create::<Route>("/routes/", json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, MutationError::InvalidPayload(ref m) if m.contains("an array")));
        assert!(client.queue().list_ordered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_create_is_rejected_offline() {
        let client = offline_client();
        let err = client
            .create::<Route>("/routes/", json!({"name": "sin datos"}))
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::InvalidPayload(_)));
        assert!(client.queue().list_ordered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_agenda_change_is_applied_locally() {
        let client = offline_client();
        let outcome = client.agenda("u1", "e1", AgendaAction::Interest).await.unwrap();
        let MutationOutcome::Queued(op) = outcome else {
            panic!("expected queued outcome");
        };
        assert_eq!(op.endpoint, "/agenda/interested/e1");
        assert_eq!(op.data, Some(json!({})));

        client.agenda("u1", "e1", AgendaAction::Attend).await.unwrap();
        let cached = AgendaCache::new(client.db.clone()).get("u1").await.unwrap().unwrap();
        assert_eq!(cached.attending, vec!["e1"]);
        assert!(cached.interested.is_empty());
        assert_eq!(client.queue().list_ordered().await.unwrap().len(), 2);
    }
}
