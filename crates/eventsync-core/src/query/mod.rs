//! Network-first, cache-fallback reads.
//!
//! Every query tries the server first, mirrors a successful result into the
//! local cache and hands it back. When the server cannot be reached the
//! cached copy is served instead, and an empty cache yields an empty result
//! rather than an error. Only a failing local store is reported upward.

pub mod agenda;
pub mod events;
pub mod fallback;
pub mod memo;
pub mod source;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use agenda::AgendaQuery;
pub use events::EventQueries;
pub use fallback::FallbackQuery;
pub use source::{AgendaSource, EventSource, ListSource};

/// Where a query result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOrigin {
    /// Fetched from the server just now.
    Network,
    /// A recent network result served within its freshness window.
    Memo,
    /// Served from the local store because the server was unreachable.
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult<T> {
    pub data: T,
    pub origin: DataOrigin,
    /// When the data left the server; unknown for cached data.
    pub fetched_at: Option<DateTime<Utc>>,
}

impl<T> QueryResult<T> {
    pub(crate) fn network(data: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            data,
            origin: DataOrigin::Network,
            fetched_at: Some(fetched_at),
        }
    }

    pub(crate) fn memo(data: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            data,
            origin: DataOrigin::Memo,
            fetched_at: Some(fetched_at),
        }
    }

    pub(crate) fn cached(data: T) -> Self {
        Self {
            data,
            origin: DataOrigin::Cache,
            fetched_at: None,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.origin == DataOrigin::Cache
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryResult<U> {
        QueryResult {
            data: f(self.data),
            origin: self.origin,
            fetched_at: self.fetched_at,
        }
    }

    /// Human-readable age such as "5m ago", or "offline" for cached data.
    pub fn age_display(&self) -> String {
        let Some(fetched_at) = self.fetched_at else {
            return "offline".to_string();
        };
        let minutes = (Utc::now() - fetched_at).num_minutes();
        if minutes < 1 {
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}
