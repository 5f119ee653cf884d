use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use super::memo::MemoTable;
use super::source::EventSource;
use super::QueryResult;
use crate::cache::EventCache;
use crate::models::{Event, EventFilter, Resource};
use crate::store::{Database, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EventKey {
    List(EventFilter),
    Upcoming(usize),
}

/// Event listings, upcoming events and event detail, each network-first.
pub struct EventQueries<S> {
    source: S,
    cache: EventCache,
    memo: MemoTable<EventKey, Vec<Event>>,
}

impl<S: EventSource> EventQueries<S> {
    pub fn new(source: S, db: Database) -> Self {
        Self::with_stale_after(source, db, Event::STALE_AFTER)
    }

    pub fn with_stale_after(source: S, db: Database, stale_after: Duration) -> Self {
        Self {
            source,
            cache: EventCache::new(db),
            memo: MemoTable::new(stale_after),
        }
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    /// Events matching `filter`.
    ///
    /// Only unfiltered and category-only results are mirrored locally. Offline,
    /// the cached events are filtered by category; date and text filters need
    /// the server.
    pub async fn list(&self, filter: &EventFilter) -> Result<QueryResult<Vec<Event>>, StorageError> {
        let key = EventKey::List(filter.clone());
        if let Some((events, fetched_at)) = self.memo.fresh(&key) {
            return Ok(QueryResult::memo(events, fetched_at));
        }

        match self.source.list_events(filter).await {
            Ok(events) => {
                let fetched_at = Utc::now();
                if filter.is_cacheable() {
                    self.persist(&events).await;
                }
                self.memo.insert(key, events.clone(), fetched_at);
                Ok(QueryResult::network(events, fetched_at))
            }
            Err(e) => {
                warn!(error = %e, ?filter, "Event list fetch failed, serving cached events");
                let cached = self
                    .cache
                    .get_all()
                    .await?
                    .into_iter()
                    .filter(|event| filter.matches_offline(event))
                    .collect();
                Ok(QueryResult::cached(cached))
            }
        }
    }

    /// The next `limit` events from now on.
    pub async fn upcoming(&self, limit: usize) -> Result<QueryResult<Vec<Event>>, StorageError> {
        let key = EventKey::Upcoming(limit);
        if let Some((events, fetched_at)) = self.memo.fresh(&key) {
            return Ok(QueryResult::memo(events, fetched_at));
        }

        match self.source.upcoming_events(limit).await {
            Ok(events) => {
                let fetched_at = Utc::now();
                self.persist(&events).await;
                self.memo.insert(key, events.clone(), fetched_at);
                Ok(QueryResult::network(events, fetched_at))
            }
            Err(e) => {
                warn!(error = %e, limit, "Upcoming events fetch failed, serving cached events");
                let now = Utc::now();
                let mut upcoming: Vec<Event> = self
                    .cache
                    .get_all()
                    .await?
                    .into_iter()
                    .filter(|event| event.is_upcoming(now))
                    .collect();
                upcoming.sort_by_key(|event| event.starts_at());
                upcoming.truncate(limit);
                Ok(QueryResult::cached(upcoming))
            }
        }
    }

    /// One event, or `None` when neither the server nor the cache knows it.
    pub async fn detail(&self, id: &str) -> Result<QueryResult<Option<Event>>, StorageError> {
        match self.source.get_event(id).await {
            Ok(event) => {
                if let Err(e) = self.cache.save_one(&event).await {
                    warn!(event_id = id, error = %e, "Failed to cache event");
                }
                Ok(QueryResult::network(Some(event), Utc::now()))
            }
            Err(e) => {
                warn!(event_id = id, error = %e, "Event fetch failed, serving cached copy");
                Ok(QueryResult::cached(self.cache.get_one(id).await?))
            }
        }
    }

    pub fn invalidate(&self) {
        self.memo.clear();
    }

    async fn persist(&self, events: &[Event]) {
        if let Err(e) = self.cache.save_many(events).await {
            warn!(error = %e, "Failed to cache fetched events");
        }
    }
}
