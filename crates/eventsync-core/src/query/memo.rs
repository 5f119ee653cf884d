use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

struct Entry<V> {
    value: V,
    fetched_at: DateTime<Utc>,
    stored: Instant,
}

/// Recent network results, each served until it is older than `stale_after`.
pub(crate) struct MemoTable<K, V> {
    stale_after: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> MemoTable<K, V> {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn fresh(&self, key: &K) -> Option<(V, DateTime<Utc>)> {
        let entries = self.lock();
        let entry = entries.get(key)?;
        (entry.stored.elapsed() < self.stale_after).then(|| (entry.value.clone(), entry.fetched_at))
    }

    pub(crate) fn insert(&self, key: K, value: V, fetched_at: DateTime<Utc>) {
        self.lock().insert(
            key,
            Entry {
                value,
                fetched_at,
                stored: Instant::now(),
            },
        );
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_within_window() {
        let memo = MemoTable::new(Duration::from_secs(60));
        memo.insert("k", 1, Utc::now());
        assert_eq!(memo.fresh(&"k").map(|(v, _)| v), Some(1));
        assert!(memo.fresh(&"other").is_none());
        memo.clear();
        assert!(memo.fresh(&"k").is_none());
    }

    #[test]
    fn test_zero_window_never_fresh() {
        let memo = MemoTable::new(Duration::ZERO);
        memo.insert((), "v", Utc::now());
        assert!(memo.fresh(&()).is_none());
    }
}
