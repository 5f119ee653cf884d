use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::ResourceKind;

/// Length of the random suffix in operation ids.
const ID_SUFFIX_LEN: usize = 9;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Failed,
}

/// A mutation that has not been confirmed by the server yet.
///
/// Payload and headers are kept exactly as captured at enqueue time; replay
/// attempts only ever touch `status`, `retries`, `error` and `last_attempt_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// `<timestamp-millis>-<random base36>`
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// Path relative to the API base URL, e.g. `/events/`.
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Creation time in milliseconds since the epoch; drives replay order.
    pub timestamp: i64,
    #[serde(default)]
    pub retries: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    /// For optimistic creates: which collection holds the provisional record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisional_key: Option<String>,
}

impl PendingOperation {
    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }
}

/// What the caller supplies when queueing a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub resource: Option<ResourceKind>,
    pub provisional_key: Option<String>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, endpoint: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            method,
            data: None,
            headers: BTreeMap::new(),
            resource: None,
            provisional_key: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Link the operation to a provisional record so replay can reconcile it.
    pub fn for_created(mut self, resource: ResourceKind, provisional_key: impl Into<String>) -> Self {
        self.resource = Some(resource);
        self.provisional_key = Some(provisional_key.into());
        self
    }

    pub(crate) fn into_operation(self, id: String, timestamp: i64) -> PendingOperation {
        PendingOperation {
            id,
            kind: self.kind,
            endpoint: self.endpoint,
            method: self.method,
            data: self.data,
            headers: self.headers,
            timestamp,
            retries: 0,
            status: OperationStatus::Pending,
            error: None,
            last_attempt_at: None,
            resource: self.resource,
            provisional_key: self.provisional_key,
        }
    }
}

pub(crate) fn generate_id(timestamp: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{}", timestamp, suffix)
}

/// Source of timestamps for the queue and the replay driver.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_shape() {
        let id = generate_id(1_700_000_000_123);
        let (ts, suffix) = id.split_once('-').unwrap();
        assert_eq!(ts, "1700000000123");
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_id(1), generate_id(1));
    }

    #[test]
    fn test_wire_names() {
        let op = OperationRequest::new(OperationKind::Create, "/events/", HttpMethod::Post)
            .with_data(serde_json::json!({"title": "x"}))
            .into_operation("1-abc".to_string(), 1);
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "CREATE");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["retries"], 0);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
