//! eventsync core - offline-first synchronization for the event-discovery API.
//!
//! The crate mirrors server collections (events, alerts, routes, users and
//! per-user agendas) in a durable local store, answers reads from that store
//! when the server cannot be reached, and queues writes made while offline
//! for ordered replay.
//!
//! - [`store`]: versioned SQLite store with collections and secondary indexes
//! - [`cache`]: per-resource cache services over the store
//! - [`query`]: network-first, cache-fallback reads
//! - [`queue`]: pending-operation queue and the replay driver
//! - [`api`]: REST client, offline mutation client and live updates

pub mod api;
pub mod cache;
pub mod models;
pub mod query;
pub mod queue;
pub mod store;

pub use api::{ApiClient, ApiError, LiveUpdates, MutationError, MutationOutcome, OfflineClient};
pub use cache::{AgendaCache, AlertCache, CacheService, EventCache, RouteCache, UserCache};
pub use query::{AgendaQuery, DataOrigin, EventQueries, FallbackQuery, QueryResult};
pub use queue::{PendingOperation, PendingQueue, RetryPolicy, SyncDriver};
pub use store::{Collection, Database, StorageError, Store};
