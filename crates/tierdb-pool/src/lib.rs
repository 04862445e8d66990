//! Connection providers for tierdb.
//!
//! A [`Pool`] hands out shared, thread-safe backend handles (storage
//! connections or remote cache clients) in round-robin order. It is the
//! only state shared between concurrently running sessions, and the point
//! where cancellation and acquire timeouts are honored.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use tierdb_core::{Error, PoolError, PoolErrorKind};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of handles checked out at once; 0 means unbounded
    pub max_active: usize,
    /// Maximum time to wait for a free slot in milliseconds
    pub acquire_timeout_ms: u64,
    /// Pause between slot checks while waiting, in milliseconds
    pub wait_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 0,
            acquire_timeout_ms: 30_000, // 30 seconds
            wait_interval_ms: 1,
        }
    }
}

impl PoolConfig {
    /// Create a configuration bounding concurrent checkouts.
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active,
            ..Default::default()
        }
    }

    /// Set acquire timeout.
    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set the pause between slot checks.
    pub fn wait_interval(mut self, ms: u64) -> Self {
        self.wait_interval_ms = ms.max(1);
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of handles in the pool
    pub size: usize,
    /// Number of handles currently checked out
    pub active: usize,
    /// Total successful acquisitions
    pub acquisitions: usize,
}

struct PoolInner<T> {
    handles: Vec<Arc<T>>,
    config: PoolConfig,
    next: AtomicUsize,
    active: AtomicUsize,
    acquisitions: AtomicUsize,
}

/// A fixed set of shared backend handles.
///
/// Cloning a pool is cheap and yields another view of the same handles.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.inner.handles.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<T: Send + Sync> Pool<T> {
    /// Create a pool over the given handles.
    pub fn new(handles: Vec<T>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handles: handles.into_iter().map(Arc::new).collect(),
                config,
                next: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                acquisitions: AtomicUsize::new(0),
            }),
        }
    }

    /// A pool holding a single shared handle.
    pub fn single(handle: T) -> Self {
        Self::new(vec![handle], PoolConfig::default())
    }

    /// A single-handle pool over a handle the caller keeps a reference to.
    pub fn shared(handle: Arc<T>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handles: vec![handle],
                config: PoolConfig::default(),
                next: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                acquisitions: AtomicUsize::new(0),
            }),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.inner.handles.len(),
            active: self.inner.active.load(Ordering::Acquire),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
        }
    }

    /// Check out the next handle.
    ///
    /// Returns `Cancelled` if `cx` is cancelled before a slot frees up, and
    /// a `PoolErrorKind::Exhausted` error once the acquire timeout passes.
    ///
    /// While every slot is taken the calling thread sleeps for
    /// `wait_interval_ms` between checks, blocking the executor thread.
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<T>, Error> {
        if self.inner.handles.is_empty() {
            return Outcome::Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Empty,
                message: "pool has no handles".to_string(),
            }));
        }

        let started = Instant::now();
        let timeout = Duration::from_millis(self.inner.config.acquire_timeout_ms);
        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            if self.try_reserve() {
                break;
            }
            if started.elapsed() >= timeout {
                tracing::warn!(
                    active = self.inner.active.load(Ordering::Relaxed),
                    timeout_ms = self.inner.config.acquire_timeout_ms,
                    "pool acquire timed out"
                );
                return Outcome::Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Exhausted,
                    message: format!(
                        "no free handle after {}ms",
                        self.inner.config.acquire_timeout_ms
                    ),
                }));
            }
            std::thread::sleep(Duration::from_millis(self.inner.config.wait_interval_ms));
        }

        let slot = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.handles.len();
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        Outcome::Ok(PooledConnection {
            conn: Arc::clone(&self.inner.handles[slot]),
            pool: Arc::clone(&self.inner),
        })
    }

    fn try_reserve(&self) -> bool {
        let max = self.inner.config.max_active;
        if max == 0 {
            self.inner.active.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }
}

/// A handle checked out from a [`Pool`]; the slot is released on drop.
pub struct PooledConnection<T> {
    conn: Arc<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> std::ops::Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    #[test]
    fn round_robin_over_handles() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(vec![1_u32, 2, 3], PoolConfig::default());

        rt.block_on(async {
            let mut seen = Vec::new();
            for _ in 0..4 {
                match pool.acquire(&cx).await {
                    Outcome::Ok(conn) => seen.push(*conn),
                    other => panic!("unexpected outcome: {other:?}"),
                }
            }
            assert_eq!(seen, vec![1, 2, 3, 1]);
        });

        let stats = pool.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.acquisitions, 4);
    }

    #[test]
    fn bounded_pool_times_out() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(vec!["a"], PoolConfig::new(1).acquire_timeout(5));

        rt.block_on(async {
            let held = match pool.acquire(&cx).await {
                Outcome::Ok(conn) => conn,
                other => panic!("unexpected outcome: {other:?}"),
            };
            assert_eq!(pool.stats().active, 1);
            let started = Instant::now();
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Exhausted),
                other => panic!("expected exhaustion, got {other:?}"),
            }
            // The caller was held for the whole timeout.
            assert!(started.elapsed() >= Duration::from_millis(5));
            drop(held);
            assert!(matches!(pool.acquire(&cx).await, Outcome::Ok(_)));
        });
    }

    #[test]
    fn empty_pool_errors() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool: Pool<u8> = Pool::new(Vec::new(), PoolConfig::default());
        rt.block_on(async {
            assert!(matches!(
                pool.acquire(&cx).await,
                Outcome::Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Empty,
                    ..
                }))
            ));
        });
    }
}
