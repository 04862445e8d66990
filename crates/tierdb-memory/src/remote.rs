//! In-process remote cache backend.
//!
//! Behaves like a single shared key/value server: string keys with
//! optional expiry, FIFO lists and append-only streams. Clones of the
//! handle are not needed; share it through a pool.

#![allow(clippy::result_large_err)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tierdb_core::{Cx, Error, Outcome, RemoteCache};

use crate::storage::run;

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Stream {
    next_seq: u64,
    entries: VecDeque<(String, String)>,
}

#[derive(Debug, Default)]
struct RemoteInner {
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, Stream>,
}

impl RemoteInner {
    fn live(&mut self, key: &str) -> Option<&mut StringEntry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.is_live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}

/// An in-memory remote cache.
#[derive(Debug, Default)]
pub struct MemoryRemoteCache {
    inner: Mutex<RemoteInner>,
    ops: AtomicUsize,
}

impl MemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteInner> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands served so far.
    pub fn op_count(&self) -> usize {
        self.ops.load(Ordering::Relaxed)
    }

    /// Live string keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .strings
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().live(key).is_some()
    }

    /// Drop everything, like `FLUSHALL`.
    pub fn flush_all(&self) {
        let mut inner = self.lock();
        inner.strings.clear();
        inner.lists.clear();
        inner.streams.clear();
    }

    fn set_sync(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.lock().strings.insert(
            key.to_string(),
            StringEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }
}

impl RemoteCache for MemoryRemoteCache {
    fn get(&self, cx: &Cx, key: &str) -> impl Future<Output = Outcome<Option<String>, Error>> + Send {
        let outcome = run(cx, || Ok(self.lock().live(key).map(|e| e.value.clone())));
        async move { outcome }
    }

    fn mget(
        &self,
        cx: &Cx,
        keys: &[String],
    ) -> impl Future<Output = Outcome<Vec<Option<String>>, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            Ok(keys
                .iter()
                .map(|key| inner.live(key).map(|e| e.value.clone()))
                .collect())
        });
        async move { outcome }
    }

    fn set(
        &self,
        cx: &Cx,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run(cx, || {
            self.set_sync(key, value, ttl);
            Ok(())
        });
        async move { outcome }
    }

    fn mset(
        &self,
        cx: &Cx,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run(cx, || {
            let expires_at = ttl.map(|ttl| Instant::now() + ttl);
            let mut inner = self.lock();
            for (key, value) in entries {
                inner.strings.insert(key, StringEntry { value, expires_at });
            }
            Ok(())
        });
        async move { outcome }
    }

    fn del(&self, cx: &Cx, keys: &[String]) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            let mut removed = 0;
            for key in keys {
                if inner.live(key).is_some() {
                    removed += 1;
                }
                inner.strings.remove(key);
                if inner.lists.remove(key).is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        });
        async move { outcome }
    }

    fn set_nx(
        &self,
        cx: &Cx,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            if inner.live(key).is_some() {
                return Ok(false);
            }
            inner.strings.insert(
                key.to_string(),
                StringEntry {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        });
        async move { outcome }
    }

    fn del_if_eq(
        &self,
        cx: &Cx,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            if inner.live(key).is_some_and(|e| e.value == expected) {
                inner.strings.remove(key);
                return Ok(true);
            }
            Ok(false)
        });
        async move { outcome }
    }

    fn expire_if_eq(
        &self,
        cx: &Cx,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            match inner.live(key) {
                Some(entry) if entry.value == expected => {
                    entry.expires_at = Some(Instant::now() + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            }
        });
        async move { outcome }
    }

    fn pttl(
        &self,
        cx: &Cx,
        key: &str,
    ) -> impl Future<Output = Outcome<Option<Duration>, Error>> + Send {
        let outcome = run(cx, || {
            let now = Instant::now();
            Ok(self
                .lock()
                .live(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now)))
        });
        async move { outcome }
    }

    fn rpush(
        &self,
        cx: &Cx,
        key: &str,
        values: Vec<String>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            let list = inner.lists.entry(key.to_string()).or_default();
            list.extend(values);
            Ok(list.len() as u64)
        });
        async move { outcome }
    }

    fn lindex(
        &self,
        cx: &Cx,
        key: &str,
        index: usize,
    ) -> impl Future<Output = Outcome<Option<String>, Error>> + Send {
        let outcome = run(cx, || {
            Ok(self.lock().lists.get(key).and_then(|l| l.get(index)).cloned())
        });
        async move { outcome }
    }

    fn lrem(
        &self,
        cx: &Cx,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            let Some(list) = inner.lists.get_mut(key) else {
                return Ok(false);
            };
            let Some(pos) = list.iter().position(|v| v == value) else {
                return Ok(false);
            };
            list.remove(pos);
            if list.is_empty() {
                inner.lists.remove(key);
            }
            Ok(true)
        });
        async move { outcome }
    }

    fn llen(&self, cx: &Cx, key: &str) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = run(cx, || {
            Ok(self.lock().lists.get(key).map_or(0, |l| l.len() as u64))
        });
        async move { outcome }
    }

    fn xadd(
        &self,
        cx: &Cx,
        stream: &str,
        value: String,
    ) -> impl Future<Output = Outcome<String, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            let stream = inner.streams.entry(stream.to_string()).or_default();
            stream.next_seq += 1;
            let id = format!("{}-0", stream.next_seq);
            stream.entries.push_back((id.clone(), value));
            Ok(id)
        });
        async move { outcome }
    }

    fn xrange(
        &self,
        cx: &Cx,
        stream: &str,
        count: usize,
    ) -> impl Future<Output = Outcome<Vec<(String, String)>, Error>> + Send {
        let outcome = run(cx, || {
            Ok(self
                .lock()
                .streams
                .get(stream)
                .map(|s| s.entries.iter().take(count).cloned().collect())
                .unwrap_or_default())
        });
        async move { outcome }
    }

    fn xdel(
        &self,
        cx: &Cx,
        stream: &str,
        ids: &[String],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = run(cx, || {
            let mut inner = self.lock();
            let Some(stream) = inner.streams.get_mut(stream) else {
                return Ok(0);
            };
            let before = stream.entries.len();
            stream.entries.retain(|(id, _)| !ids.contains(id));
            Ok((before - stream.entries.len()) as u64)
        });
        async move { outcome }
    }

    fn xlen(&self, cx: &Cx, stream: &str) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = run(cx, || {
            Ok(self
                .lock()
                .streams
                .get(stream)
                .map_or(0, |s| s.entries.len() as u64))
        });
        async move { outcome }
    }
}
