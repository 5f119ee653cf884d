//! REST client for the event-discovery backend.
//!
//! This module provides the `ApiClient` for the JSON API, the offline-aware
//! `OfflineClient` that queues mutations when the server is unreachable,
//! and `LiveUpdates` for the server-sent alert stream.
//!
//! Requests carry a bearer token when one is configured; obtaining and
//! refreshing that token is left to the caller.

pub mod client;
pub mod error;
pub mod offline;
pub mod stream;

pub use client::{ApiClient, DEFAULT_API_BASE_URL};
pub use error::ApiError;
pub use offline::{AgendaAction, MutationError, MutationOutcome, OfflineClient};
pub use stream::{LiveMessage, LiveUpdates, Subscription};
