use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
    pub last_access: Instant,
    recency: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded in-process tier: least-recently-used eviction plus per-entry TTL.
///
/// Time is always passed in so callers decide the clock; reads refresh
/// recency but never move `expires_at`.
#[derive(Debug)]
pub struct MemoryCache<V> {
    capacity: usize,
    entries: HashMap<String, CacheEntry<V>>,
    recency: BTreeMap<u64, String>,
    next_recency: u64,
    stats: CacheStats,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_recency: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    fn bump_recency(&mut self) -> u64 {
        let tick = self.next_recency;
        self.next_recency = self.next_recency.wrapping_add(1);
        tick
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.stats.misses += 1;
                return None;
            }
        };

        if expired {
            self.remove(key);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }

        let tick = self.bump_recency();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.recency);
        entry.recency = tick;
        entry.access_count = entry.access_count.saturating_add(1);
        entry.last_access = now;
        self.recency.insert(tick, key.to_string());
        self.stats.hits += 1;
        Some(entry.value.clone())
    }

    /// Inserts or replaces `key`; returns the key evicted to make room.
    pub fn insert(&mut self, key: &str, value: V, ttl: Duration, now: Instant) -> Option<String> {
        let mut evicted = None;
        if let Some(previous) = self.entries.remove(key) {
            self.recency.remove(&previous.recency);
        } else if self.entries.len() >= self.capacity {
            evicted = self.evict_least_recent();
        }

        let tick = self.bump_recency();
        self.recency.insert(tick, key.to_string());
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                access_count: 0,
                last_access: now,
                recency: tick,
            },
        );
        evicted
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.stats.evictions += 1;
        Some(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.recency);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Removes every expired entry; returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }
}
