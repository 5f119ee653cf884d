//! Durable queue of mutations made while offline, and the driver that
//! replays them against the server.
//!
//! - `PendingOperation`: one captured request, with status and retry count
//! - `PendingQueue`: enqueue, ordered listing and status transitions
//! - `SyncDriver`: replays due operations in creation order

pub mod operation;
pub mod pending;
pub mod replay;

pub use operation::{
    Clock, HttpMethod, ManualClock, OperationKind, OperationRequest, OperationStatus,
    PendingOperation, SystemClock,
};
pub use pending::{PendingQueue, QueueCounts};
pub use replay::{ReplayTransport, RetryPolicy, SyncDriver, SyncReport, SyncStatus, SyncWorker};
