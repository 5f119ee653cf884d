use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::operation::PendingOperation;
use super::pending::PendingQueue;
use crate::api::ApiError;
use crate::cache::reconcile_created;
use crate::store::{Database, StorageError};

/// Sends a captured operation to the server.
#[async_trait]
pub trait ReplayTransport: Send + Sync {
    /// Returns the decoded response body, if the server sent one.
    async fn replay(&self, operation: &PendingOperation) -> Result<Option<Value>, ApiError>;
}

/// Bounded retry schedule for queued operations.
///
/// After `n` attempts an operation waits `base_backoff * 2^(n-1)` (capped at
/// `max_backoff`) from its last attempt before the next automatic one. Once
/// `max_attempts` is reached it is left `failed` for a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempts - 1);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    pub fn is_exhausted(&self, operation: &PendingOperation) -> bool {
        operation.retries >= self.max_attempts
    }

    /// Whether an automatic pass may replay the operation at `now_millis`.
    pub fn is_due(&self, operation: &PendingOperation, now_millis: i64) -> bool {
        if self.is_exhausted(operation) {
            return false;
        }
        match operation.last_attempt_at {
            None => true,
            Some(last) => {
                let wait = i64::try_from(self.backoff_for(operation.retries).as_millis()).unwrap_or(i64::MAX);
                now_millis.saturating_sub(last) >= wait
            }
        }
    }
}

/// Snapshot broadcast to status subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub failed: usize,
    pub syncing: bool,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    /// Not due yet, or held behind an earlier failure on the same endpoint.
    pub deferred: usize,
    /// Out of automatic attempts.
    pub exhausted: usize,
    /// Another pass was already running.
    pub skipped: bool,
    /// `(operation id, error text)` for each failure in this pass.
    pub errors: Vec<(String, String)>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

enum Attempt {
    Synced,
    Failed(String),
    Vanished,
}

struct DriverInner {
    db: Database,
    queue: PendingQueue,
    transport: Arc<dyn ReplayTransport>,
    policy: RetryPolicy,
    running: Mutex<()>,
    status: watch::Sender<SyncStatus>,
}

/// Replays queued operations in creation order.
///
/// Only one pass runs at a time per driver; a call made while a pass is in
/// progress returns a report with `skipped` set.
#[derive(Clone)]
pub struct SyncDriver {
    inner: Arc<DriverInner>,
}

impl SyncDriver {
    pub fn new(db: Database, queue: PendingQueue, transport: Arc<dyn ReplayTransport>) -> Self {
        Self::with_policy(db, queue, transport, RetryPolicy::default())
    }

    pub fn with_policy(
        db: Database,
        queue: PendingQueue,
        transport: Arc<dyn ReplayTransport>,
        policy: RetryPolicy,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            inner: Arc::new(DriverInner {
                db,
                queue,
                transport,
                policy,
                running: Mutex::new(()),
                status,
            }),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.status.borrow().syncing
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Replay every due operation once, oldest first.
    pub async fn sync_pending(&self) -> Result<SyncReport, StorageError> {
        let Ok(_guard) = self.inner.running.try_lock() else {
            debug!("Sync already in progress");
            return Ok(SyncReport::skipped());
        };

        let operations = self.inner.queue.list_ordered().await?;
        if operations.is_empty() {
            self.publish(false).await;
            return Ok(SyncReport::default());
        }

        let now = self.inner.queue.now_millis();
        let mut report = SyncReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        self.publish(true).await;

        for op in operations {
            if self.inner.policy.is_exhausted(&op) {
                report.exhausted += 1;
                continue;
            }
            if blocked.contains(&op.endpoint) {
                report.deferred += 1;
                continue;
            }
            if !self.inner.policy.is_due(&op, now) {
                // Later writes to the same endpoint must not overtake this one.
                blocked.insert(op.endpoint.clone());
                report.deferred += 1;
                continue;
            }

            match self.attempt(&op.id).await {
                Ok(Attempt::Synced) => report.synced += 1,
                Ok(Attempt::Failed(message)) => {
                    report.failed += 1;
                    report.errors.push((op.id.clone(), message));
                    blocked.insert(op.endpoint);
                }
                Ok(Attempt::Vanished) => {}
                Err(e) => {
                    self.publish(false).await;
                    return Err(e);
                }
            }
        }

        self.publish(false).await;
        if report.synced > 0 || report.failed > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                "Sync pass complete"
            );
        }
        Ok(report)
    }

    /// Replay one operation now, ignoring the retry schedule.
    pub async fn retry(&self, id: &str) -> Result<SyncReport, StorageError> {
        let Ok(_guard) = self.inner.running.try_lock() else {
            return Ok(SyncReport::skipped());
        };

        self.publish(true).await;
        let attempt = self.attempt(id).await;
        self.publish(false).await;

        let mut report = SyncReport::default();
        match attempt? {
            Attempt::Synced => report.synced = 1,
            Attempt::Failed(message) => {
                report.failed = 1;
                report.errors.push((id.to_string(), message));
            }
            Attempt::Vanished => debug!(op_id = id, "Nothing to retry"),
        }
        Ok(report)
    }

    async fn attempt(&self, id: &str) -> Result<Attempt, StorageError> {
        let Some(op) = self.inner.queue.mark_syncing(id).await? else {
            return Ok(Attempt::Vanished);
        };

        match self.inner.transport.replay(&op).await {
            Ok(body) => {
                self.inner.queue.remove(&op.id).await?;
                info!(op_id = %op.id, endpoint = %op.endpoint, attempt = op.retries, "Operation synced");

                if let (Some(kind), Some(key), Some(body)) =
                    (op.resource, op.provisional_key.as_deref(), body.as_ref())
                {
                    match reconcile_created(&self.inner.db, kind, key, body).await {
                        Ok(true) => {}
                        Ok(false) => warn!(op_id = %op.id, key, "Provisional record kept, server reply was not a record"),
                        Err(e) => warn!(op_id = %op.id, key, error = %e, "Failed to reconcile provisional record"),
                    }
                }
                Ok(Attempt::Synced)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(op_id = %op.id, endpoint = %op.endpoint, attempt = op.retries, error = %message, "Replay failed");
                self.inner.queue.mark_failed(&op.id, &message).await?;
                Ok(Attempt::Failed(message))
            }
        }
    }

    async fn publish(&self, syncing: bool) {
        match self.inner.queue.counts().await {
            Ok(counts) => {
                self.inner.status.send_replace(SyncStatus {
                    pending: counts.pending,
                    failed: counts.failed,
                    syncing,
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to read queue counts");
                self.inner.status.send_modify(|status| status.syncing = syncing);
            }
        }
    }

    /// Run a pass every `interval` until the returned worker is shut down or dropped.
    pub fn spawn(&self, interval: Duration) -> SyncWorker {
        let driver = self.clone();
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        if let Err(e) = driver.sync_pending().await {
                            error!(error = %e, "Background sync failed");
                        }
                    }
                }
            }
            debug!("Sync worker stopped");
        });

        SyncWorker { shutdown, handle }
    }
}

/// Handle to a background sync loop.
pub struct SyncWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Stop the loop and wait for any in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sync worker ended abnormally");
        }
    }
}
