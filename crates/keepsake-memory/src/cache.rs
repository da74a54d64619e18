//! Bounded in-memory views over the store.
//!
//! A [`CacheSnapshot`] is immutable once published. Writers build a new
//! snapshot and swap the `Arc` under a short write lock; readers clone the
//! `Arc` and never observe a half-built view.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use keepsake_types::{Importance, MemoryRecord};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::store::{MemoryStore, RecordFilter, RecordOrder};

/// Default capacity of each view.
pub const DEFAULT_CACHE_SIZE: usize = 20;
/// Default minimum importance for the important view.
pub const DEFAULT_IMPORTANT_THRESHOLD: Importance = Importance::new(70);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    /// Most important first, at least the configured threshold.
    pub important: Vec<MemoryRecord>,
    /// Newest first.
    pub recent: Vec<MemoryRecord>,
    pub loaded_at: Option<DateTime<Utc>>,
}

pub struct MemoryCache {
    capacity: usize,
    important_threshold: Importance,
    current: RwLock<Arc<CacheSnapshot>>,
    /// Number of pushes so far. Only bumped under the write lock.
    pushes: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: usize, important_threshold: Importance) -> Self {
        Self {
            capacity,
            important_threshold,
            current: RwLock::new(Arc::new(CacheSnapshot::default())),
            pushes: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Up to `limit` of the newest cached records.
    pub fn recent(&self, limit: usize) -> Vec<MemoryRecord> {
        self.snapshot().recent.iter().take(limit).cloned().collect()
    }

    pub fn important(&self) -> Vec<MemoryRecord> {
        self.snapshot().important.clone()
    }

    /// Prepend a freshly written record to the recent view, dropping the
    /// oldest entry beyond capacity. Records already expired at `now` are
    /// not cached.
    pub fn push_recent(&self, record: MemoryRecord, now: DateTime<Utc>) {
        if record.is_expired(now) {
            return;
        }
        let mut current = self.current.write();
        let mut recent = Vec::with_capacity(self.capacity);
        recent.push(record);
        recent.extend(current.recent.iter().take(self.capacity.saturating_sub(1)).cloned());
        recent.truncate(self.capacity);
        *current = Arc::new(CacheSnapshot {
            important: current.important.clone(),
            recent,
            loaded_at: current.loaded_at,
        });
        self.pushes.fetch_add(1, Ordering::AcqRel);
    }

    /// Rebuild both views from the store.
    ///
    /// Records pushed while the store was being read are carried over into
    /// the new recent view, so a reload never hides a newer write. Anything
    /// cached before the read started is replaced by what the store holds.
    pub fn reload(&self, store: &MemoryStore, now: DateTime<Utc>) -> Result<()> {
        let pushes_before = self.pushes.load(Ordering::Acquire);
        let important = store.query(
            &RecordFilter::new()
                .min_importance(self.important_threshold)
                .live_at(now)
                .order(RecordOrder::ImportanceThenRecency)
                .limit(self.capacity),
        )?;
        let loaded = store.recent(self.capacity, now)?;

        let mut current = self.current.write();
        let pushed_during = self.pushes.load(Ordering::Acquire).saturating_sub(pushes_before);
        let carried = usize::try_from(pushed_during).unwrap_or(usize::MAX);
        let mut recent: Vec<MemoryRecord> = current
            .recent
            .iter()
            .take(carried)
            .filter(|r| !r.is_expired(now) && !loaded.iter().any(|l| l.id == r.id))
            .cloned()
            .collect();
        recent.extend(loaded);
        recent.truncate(self.capacity);
        debug!(
            important = important.len(),
            recent = recent.len(),
            carried = pushed_during,
            "reloaded memory cache"
        );
        *current = Arc::new(CacheSnapshot {
            important,
            recent,
            loaded_at: Some(now),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeletePredicate, NewRecord};
    use keepsake_types::MemoryKind;
    use serde_json::json;

    fn write(store: &MemoryStore, importance: i64) -> MemoryRecord {
        let rec = NewRecord::event(MemoryKind::event("note").unwrap(), json!({ "i": importance }))
            .unwrap()
            .importance(Importance::new(importance));
        store.insert_record(rec, Utc::now()).unwrap()
    }

    #[test]
    fn recent_view_is_capped_newest_first() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cache = MemoryCache::new(3, DEFAULT_IMPORTANT_THRESHOLD);
        let ids: Vec<_> = (0..5)
            .map(|i| {
                let r = write(&store, 50 + i);
                let id = r.id;
                cache.push_recent(r, Utc::now());
                id
            })
            .collect();
        let recent: Vec<_> = cache.recent(10).into_iter().map(|r| r.id).collect();
        assert_eq!(recent, vec![ids[4], ids[3], ids[2]]);
        assert_eq!(cache.recent(1).len(), 1);
    }

    #[test]
    fn reload_fills_important_view_above_threshold() {
        let store = MemoryStore::open_in_memory().unwrap();
        let low = write(&store, 69);
        let hi = write(&store, 95);
        let mid = write(&store, 70);
        let cache = MemoryCache::new(20, DEFAULT_IMPORTANT_THRESHOLD);
        cache.reload(&store, Utc::now()).unwrap();

        let important: Vec<_> = cache.important().into_iter().map(|r| r.id).collect();
        assert_eq!(important, vec![hi.id, mid.id]);
        assert!(!important.contains(&low.id));
        assert_eq!(cache.snapshot().recent.len(), 3);
        assert!(cache.snapshot().loaded_at.is_some());
    }

    #[test]
    fn reload_drops_entries_cached_before_the_read() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cache = MemoryCache::new(5, DEFAULT_IMPORTANT_THRESHOLD);
        let kept = write(&store, 50);
        cache.push_recent(kept.clone(), Utc::now());
        // Cached, then deleted from the store before the refresh.
        let gone = write(&store, 5);
        cache.push_recent(gone.clone(), Utc::now());
        let removed = store
            .delete_where(&DeletePredicate {
                importance_below: Some(Importance::new(10)),
                ..DeletePredicate::default()
            })
            .unwrap();
        assert_eq!(removed, vec![gone.id]);

        cache.reload(&store, Utc::now()).unwrap();
        let ids: Vec<_> = cache.recent(10).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![kept.id]);
    }

    #[test]
    fn reload_of_an_empty_store_clears_the_recent_view() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cache = MemoryCache::new(5, DEFAULT_IMPORTANT_THRESHOLD);
        let mut phantom = write(&store, 50);
        phantom.id += 1000;
        cache.push_recent(phantom, Utc::now());
        let other = MemoryStore::open_in_memory().unwrap();
        cache.reload(&other, Utc::now()).unwrap();
        assert!(cache.recent(10).is_empty());
    }

    #[test]
    fn expired_records_are_not_cached() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cache = MemoryCache::new(5, DEFAULT_IMPORTANT_THRESHOLD);
        let now = Utc::now();
        let mut stale = write(&store, 50);
        stale.expires_at = Some(now - chrono::Duration::seconds(1));
        cache.push_recent(stale, now);
        assert!(cache.recent(10).is_empty());
    }

    #[test]
    fn readers_see_whole_snapshots() {
        let store = MemoryStore::open_in_memory().unwrap();
        let cache = Arc::new(MemoryCache::new(4, DEFAULT_IMPORTANT_THRESHOLD));
        let records: Vec<_> = (0..8).map(|_| write(&store, 50)).collect();

        let writer = {
            let cache = Arc::clone(&cache);
            let records = records.clone();
            std::thread::spawn(move || {
                for r in records {
                    cache.push_recent(r, Utc::now());
                }
            })
        };
        for _ in 0..200 {
            let snap = cache.snapshot();
            assert!(snap.recent.len() <= 4);
            // Newest first and contiguous: every published view is a window
            // of the push sequence.
            for pair in snap.recent.windows(2) {
                assert_eq!(pair[0].id, pair[1].id + 1);
            }
        }
        writer.join().unwrap();
        assert_eq!(cache.recent(10).len(), 4);
    }
}
