//! In-process cache tier.
//!
//! A bounded map with per-entry expiry. When full, the least recently used
//! entry is evicted. Shared by every session of an engine, so all access
//! goes through a mutex.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::keys::CacheEntry;

#[derive(Debug)]
struct LocalEntry {
    value: CacheEntry,
    expires_at: Option<Instant>,
    /// Logical clock of the last access; smallest is evicted first.
    last_used: u64,
}

#[derive(Debug)]
struct LocalInner {
    entries: HashMap<String, LocalEntry>,
    clock: u64,
    evictions: u64,
}

/// A named local cache pool.
#[derive(Debug)]
pub struct LocalCache {
    name: String,
    capacity: usize,
    inner: Mutex<LocalInner>,
}

impl LocalCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(LocalInner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                clock: 0,
                evictions: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a live entry, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now_tick = inner.clock;
        let expired = match inner.entries.get_mut(key) {
            None => return None,
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| at <= Instant::now()) {
                    true
                } else {
                    entry.last_used = now_tick;
                    return Some(entry.value.clone());
                }
            }
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    /// Insert or replace an entry.
    pub fn set(&self, key: String, value: CacheEntry, ttl: Option<Duration>) {
        let mut inner = self.lock();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            Self::evict_lru(&mut inner);
        }
        inner.clock += 1;
        let last_used = inner.clock;
        inner.entries.insert(
            key,
            LocalEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                last_used,
            },
        );
    }

    /// Remove entries, returning how many were present.
    pub fn remove<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> usize {
        let mut inner = self.lock();
        keys.into_iter()
            .filter(|key| inner.entries.remove(key.as_str()).is_some())
            .count()
    }

    /// Check if a live entry exists without touching recency.
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| e.expires_at.is_none_or(|at| at > Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries evicted for capacity since creation.
    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn evict_lru(inner: &mut LocalInner) {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        if !expired.is_empty() {
            for key in expired {
                inner.entries.remove(&key);
            }
            return;
        }
        if let Some(lru_key) = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(k, _)| k.clone())
        {
            inner.entries.remove(&lru_key);
            inner.evictions += 1;
        }
    }
}
