//! Distributed lock service on the remote cache backend.
//!
//! A lock is a key holding a random owner token, written with set-if-absent
//! and an expiry. Release and refresh compare the token before acting, so a
//! holder whose lock expired and was taken by someone else cannot release
//! or extend the new owner's lock.
//!
//! The lock is advisory: it coordinates callers that use it, such as the
//! single consumer of a deferred queue. The engine never takes one itself.
//!
//! # Example
//!
//! ```ignore
//! let locker = Locker::new(pool);
//! if let Some(lock) = locker.obtain(&cx, "lazy-digest", Duration::from_secs(30), Duration::ZERO).await? {
//!     receiver.digest_all(&cx, 100).await?;
//!     lock.release(&cx).await?;
//! }
//! ```

use std::time::{Duration, Instant};

use asupersync::{Cx, Outcome};
use tierdb_core::{Error, RemoteCache, try_outcome};
use tierdb_pool::Pool;

/// Lock service configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Pause between attempts while waiting for a held lock.
    pub retry_interval: Duration,
    /// Prefix of lock keys in the remote cache.
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(10),
            key_prefix: "_lock:".to_string(),
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Hands out locks stored in one remote cache pool.
#[derive(Debug, Clone)]
pub struct Locker<R> {
    pool: Pool<R>,
    config: LockConfig,
}

impl<R: RemoteCache> Locker<R> {
    pub fn new(pool: Pool<R>) -> Self {
        Self::with_config(pool, LockConfig::default())
    }

    pub fn with_config(pool: Pool<R>, config: LockConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.config.key_prefix, name)
    }

    /// Try to take the lock `name` for `ttl`, retrying for up to `wait`.
    ///
    /// Returns `None` when the lock is still held by someone else once
    /// `wait` has passed. A zero `ttl` is rejected with
    /// [`Error::LockAcquisition`].
    ///
    /// Between attempts this sleeps on the calling thread for
    /// `retry_interval`, so a contended lock blocks the executor thread for
    /// up to `wait`. Pass a zero `wait` from code that must not block.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn obtain(
        &self,
        cx: &Cx,
        name: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Outcome<Option<Lock<R>>, Error> {
        if ttl.is_zero() {
            return Outcome::Err(Error::LockAcquisition(format!(
                "lock '{name}' needs a non-zero ttl"
            )));
        }
        let key = self.key(name);
        let token = new_token();
        let started = Instant::now();
        let mut attempts = 0_u32;

        loop {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            attempts += 1;
            let taken = {
                let conn = try_outcome!(self.pool.acquire(cx).await);
                try_outcome!(conn.set_nx(cx, &key, token.clone(), ttl).await)
            };
            if taken {
                tracing::debug!(target: "tierdb::lock", key = %key, attempts, "Lock obtained");
                return Outcome::Ok(Some(Lock {
                    pool: self.pool.clone(),
                    key,
                    token,
                }));
            }
            if started.elapsed() >= wait {
                tracing::debug!(target: "tierdb::lock", key = %key, attempts, "Lock busy");
                return Outcome::Ok(None);
            }
            std::thread::sleep(self.config.retry_interval.min(wait.saturating_sub(started.elapsed())));
        }
    }
}

/// A held lock. Dropping it does not release it; it expires with its ttl.
#[derive(Debug)]
pub struct Lock<R> {
    pool: Pool<R>,
    key: String,
    token: String,
}

impl<R: RemoteCache> Lock<R> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock if this handle still owns it.
    ///
    /// Returns false when the lock had already expired or changed owner;
    /// releasing twice is harmless.
    pub async fn release(&self, cx: &Cx) -> Outcome<bool, Error> {
        let conn = try_outcome!(self.pool.acquire(cx).await);
        let released = try_outcome!(conn.del_if_eq(cx, &self.key, &self.token).await);
        tracing::debug!(target: "tierdb::lock", key = %self.key, released, "Lock released");
        Outcome::Ok(released)
    }

    /// Time left before the lock expires; `None` once it is gone.
    pub async fn ttl(&self, cx: &Cx) -> Outcome<Option<Duration>, Error> {
        let conn = try_outcome!(self.pool.acquire(cx).await);
        let holder = try_outcome!(conn.get(cx, &self.key).await);
        if holder.as_deref() != Some(self.token.as_str()) {
            return Outcome::Ok(None);
        }
        conn.pttl(cx, &self.key).await
    }

    /// Extend the lock to `ttl` from now if this handle still owns it.
    pub async fn refresh(&self, cx: &Cx, ttl: Duration) -> Outcome<bool, Error> {
        if ttl.is_zero() {
            return Outcome::Err(Error::LockAcquisition(format!(
                "lock '{}' needs a non-zero ttl",
                self.key
            )));
        }
        let conn = try_outcome!(self.pool.acquire(cx).await);
        let refreshed = try_outcome!(conn.expire_if_eq(cx, &self.key, &self.token, ttl).await);
        tracing::debug!(target: "tierdb::lock", key = %self.key, refreshed, "Lock refreshed");
        Outcome::Ok(refreshed)
    }
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
