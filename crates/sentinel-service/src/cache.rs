//! C5 — scan cache. Avoids re-running every engine against a file that
//! hasn't changed since the last scan. Keyed on (sha256, size, mtime) so a
//! rewritten file with the same content hash but a different size or
//! write time always misses — a mutation must invalidate.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sentinel_core::model::AggregatedResult;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    sha256: String,
    size: u64,
    last_write_millis: i64,
}

struct CacheEntry {
    result: AggregatedResult,
    inserted_at: Instant,
}

pub struct ScanCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl ScanCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Evicts the oldest-inserted entries until the cache is back under its
    /// configured bound. Called after every insert rather than on a timer,
    /// since unbounded growth under a scan storm is the failure mode this
    /// guards against.
    fn evict_to_bound(&self) {
        let mut entries = self.entries.write();
        if entries.len() <= self.max_entries {
            return;
        }
        let overflow = entries.len() - self.max_entries;
        let mut oldest: Vec<(CacheKey, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.inserted_at))
            .collect();
        oldest.sort_by_key(|(_, inserted_at)| *inserted_at);
        for (key, _) in oldest.into_iter().take(overflow) {
            entries.remove(&key);
        }
    }

    fn key(sha256: &str, size: u64, last_write: Option<DateTime<Utc>>) -> CacheKey {
        CacheKey {
            sha256: sha256.to_string(),
            size,
            last_write_millis: last_write.map(|t| t.timestamp_millis()).unwrap_or(0),
        }
    }

    /// Returns a deep clone of the cached result; the caller's mutations
    /// never influence what a later `try_get` returns.
    pub fn try_get(
        &self,
        sha256: &str,
        size: u64,
        last_write: Option<DateTime<Utc>>,
    ) -> Option<AggregatedResult> {
        let key = Self::key(sha256, size, last_write);
        let entries = self.entries.read();
        entries.get(&key).and_then(|e| {
            if e.inserted_at.elapsed() < self.ttl {
                Some(e.result.clone())
            } else {
                None
            }
        })
    }

    pub fn store(
        &self,
        sha256: &str,
        size: u64,
        last_write: Option<DateTime<Utc>>,
        result: AggregatedResult,
    ) {
        let key = Self::key(sha256, size, last_write);
        self.entries.write().insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        self.evict_to_bound();
    }

    /// Drops every cached entry for `path`, regardless of which content hash
    /// it was stored under. Used when a file is known to have changed (e.g.
    /// after a quarantine or restore) and a stale hit would be wrong even if
    /// the new content happened to collide on size and mtime.
    pub fn invalidate_path(&self, path: &PathBuf) {
        self.entries.write().retain(|_, e| &e.result.path != path);
    }

    /// Drops every entry whose TTL has elapsed. Call periodically from the
    /// scan controller's housekeeping tick; the cache never evicts itself.
    pub fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.entries.write().retain(|_, e| e.inserted_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::model::Verdict;
    use std::time::Duration as StdDuration;

    fn sample_result(path: &str) -> AggregatedResult {
        AggregatedResult {
            path: PathBuf::from(path),
            risk_score: 0,
            verdict: Verdict::Allow,
            reasons: vec![],
            engine_results: vec![],
            duration: StdDuration::from_millis(1),
        }
    }

    #[test]
    fn hit_on_matching_key_miss_on_hash_change() {
        let cache = ScanCache::new(StdDuration::from_secs(60), 100);
        cache.store("hash1", 10, None, sample_result("/tmp/a.txt"));
        assert!(cache.try_get("hash1", 10, None).is_some());
        assert!(cache.try_get("hash2", 10, None).is_none());
    }

    #[test]
    fn miss_on_size_or_mtime_change() {
        let cache = ScanCache::new(StdDuration::from_secs(60), 100);
        cache.store("hash1", 10, None, sample_result("/tmp/a.txt"));
        assert!(cache.try_get("hash1", 11, None).is_none());
        let t = Utc::now();
        assert!(cache.try_get("hash1", 10, Some(t)).is_none());
    }

    #[test]
    fn returned_clone_is_independent_of_cached_state() {
        let cache = ScanCache::new(StdDuration::from_secs(60), 100);
        cache.store("hash1", 10, None, sample_result("/tmp/a.txt"));
        let mut first = cache.try_get("hash1", 10, None).unwrap();
        first.risk_score = 99;
        first.reasons.push("mutated by caller".into());
        let second = cache.try_get("hash1", 10, None).unwrap();
        assert_eq!(second.risk_score, 0);
        assert!(second.reasons.is_empty());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = ScanCache::new(StdDuration::from_millis(1), 100);
        cache.store("hash1", 10, None, sample_result("/tmp/a.txt"));
        std::thread::sleep(StdDuration::from_millis(20));
        assert!(cache.try_get("hash1", 10, None).is_none());
    }

    #[test]
    fn invalidate_path_removes_all_entries_for_path() {
        let cache = ScanCache::new(StdDuration::from_secs(60), 100);
        cache.store("hash1", 10, None, sample_result("/tmp/a.txt"));
        cache.invalidate_path(&PathBuf::from("/tmp/a.txt"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn oldest_entry_is_evicted_when_over_bound() {
        let cache = ScanCache::new(StdDuration::from_secs(60), 2);
        cache.store("hash1", 1, None, sample_result("/tmp/a.txt"));
        std::thread::sleep(StdDuration::from_millis(5));
        cache.store("hash2", 1, None, sample_result("/tmp/b.txt"));
        std::thread::sleep(StdDuration::from_millis(5));
        cache.store("hash3", 1, None, sample_result("/tmp/c.txt"));
        assert_eq!(cache.len(), 2);
        assert!(cache.try_get("hash1", 1, None).is_none());
        assert!(cache.try_get("hash3", 1, None).is_some());
    }
}
