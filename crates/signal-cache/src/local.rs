use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Entry with its insert time, the TTL decided at insert, and the last
/// access time used by the trim pass.
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    cached_at: DateTime<Utc>,
    ttl: Duration,
    last_access: DateTime<Utc>,
}

/// Process-local cache tier. Reads never block writers beyond the sharded
/// DashMap locks; expiry is checked on read, eviction happens in the
/// periodic trim pass.
pub struct LocalCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
    max_entries: usize,
}

impl<T: Clone> LocalCache<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn put(&self, key: String, data: T, ttl: Duration) {
        let now = Utc::now();
        self.entries.insert(
            key,
            CacheEntry {
                data,
                cached_at: now,
                ttl,
                last_access: now,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let now = Utc::now();
        {
            let mut entry = self.entries.get_mut(key)?;
            let age = (now - entry.cached_at).to_std().unwrap_or_default();
            if age <= entry.ttl {
                entry.last_access = now;
                return Some(entry.data.clone());
            }
        }
        // Expired: drop it so the trim pass has less to scan.
        self.entries.remove(key);
        None
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, then evict least-recently-accessed entries
    /// until occupancy is back under the configured bound.
    pub fn trim(&self) {
        let now = Utc::now();
        self.entries.retain(|_, entry| {
            let age = (now - entry.cached_at).to_std().unwrap_or_default();
            age <= entry.ttl
        });

        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let mut by_access: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_access))
            .collect();
        by_access.sort_by_key(|(_, at)| *at);
        for (key, _) in by_access.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_read_as_miss() {
        let cache: LocalCache<i32> = LocalCache::new(10);
        cache.put("k".to_string(), 1, Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn trim_evicts_down_to_bound() {
        let cache: LocalCache<i32> = LocalCache::new(2);
        cache.put("a".to_string(), 1, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("b".to_string(), 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("c".to_string(), 3, Duration::from_secs(60));
        // Touch "a" so "b" is the stalest.
        assert_eq!(cache.get("a"), Some(1));

        cache.trim();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }
}
