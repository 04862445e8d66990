//! Backend traits: relational storage and the remote cache tier.
//!
//! Every operation takes the caller's [`Cx`] and resolves to an
//! [`Outcome`], so cancellation flows through the backends untouched.

use std::future::Future;
use std::time::Duration;

use asupersync::{Cx, Outcome};

use crate::row::Row;
use crate::statement::Statement;

/// Result of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Id assigned by an insert that did not name one.
    pub last_insert_id: Option<u64>,
}

/// A handle to the relational storage backend.
///
/// Constraint violations are reported as [`crate::Error::Query`] with a
/// SQLSTATE (`23505` unique, `23503` foreign key) and the constraint name
/// in `detail`; the engine translates them into typed errors.
pub trait Connection: Send + Sync {
    /// Run a `Select` and return all rows.
    fn query(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Run an `Insert`, `Update` or `Delete`.
    fn execute(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, crate::Error>> + Send;

    /// Check if the connection is still valid.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Alias for ping that returns bool.
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }
}

/// A handle to the remote cache backend.
///
/// Values are opaque strings. Besides keyed get/set the backend offers
/// FIFO lists and append-only streams, used by the deferred-write queues,
/// and compare-and-act primitives used by the lock service.
pub trait RemoteCache: Send + Sync {
    fn get(
        &self,
        cx: &Cx,
        key: &str,
    ) -> impl Future<Output = Outcome<Option<String>, crate::Error>> + Send;

    /// Batch get; the result is aligned with `keys`.
    fn mget(
        &self,
        cx: &Cx,
        keys: &[String],
    ) -> impl Future<Output = Outcome<Vec<Option<String>>, crate::Error>> + Send;

    fn set(
        &self,
        cx: &Cx,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    fn mset(
        &self,
        cx: &Cx,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Delete keys, returning how many existed.
    fn del(
        &self,
        cx: &Cx,
        keys: &[String],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Set only if the key is absent. Returns whether the value was written.
    fn set_nx(
        &self,
        cx: &Cx,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Outcome<bool, crate::Error>> + Send;

    /// Delete the key only while it still holds `expected`.
    fn del_if_eq(
        &self,
        cx: &Cx,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Outcome<bool, crate::Error>> + Send;

    /// Reset the expiry only while the key still holds `expected`.
    fn expire_if_eq(
        &self,
        cx: &Cx,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> impl Future<Output = Outcome<bool, crate::Error>> + Send;

    /// Remaining time to live; `None` for a missing key or one without expiry.
    fn pttl(
        &self,
        cx: &Cx,
        key: &str,
    ) -> impl Future<Output = Outcome<Option<Duration>, crate::Error>> + Send;

    /// Append values to the tail of a list in one step, returning the new
    /// length.
    fn rpush(
        &self,
        cx: &Cx,
        key: &str,
        values: Vec<String>,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Read the element at `index` without removing it; 0 is the head.
    fn lindex(
        &self,
        cx: &Cx,
        key: &str,
        index: usize,
    ) -> impl Future<Output = Outcome<Option<String>, crate::Error>> + Send;

    /// Remove the first element equal to `value`, returning whether one
    /// was removed.
    fn lrem(
        &self,
        cx: &Cx,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Outcome<bool, crate::Error>> + Send;

    fn llen(&self, cx: &Cx, key: &str)
    -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Append to a stream, returning the entry id.
    fn xadd(
        &self,
        cx: &Cx,
        stream: &str,
        value: String,
    ) -> impl Future<Output = Outcome<String, crate::Error>> + Send;

    /// Read up to `count` oldest entries without removing them.
    fn xrange(
        &self,
        cx: &Cx,
        stream: &str,
        count: usize,
    ) -> impl Future<Output = Outcome<Vec<(String, String)>, crate::Error>> + Send;

    /// Acknowledge (remove) entries by id.
    fn xdel(
        &self,
        cx: &Cx,
        stream: &str,
        ids: &[String],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    fn xlen(
        &self,
        cx: &Cx,
        stream: &str,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;
}

/// Propagate the non-`Ok` arms of an [`Outcome`], yielding the `Ok` value.
///
/// The async counterpart of `?` for functions returning `Outcome`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e.into()),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Lift a synchronous `Result` into an `Outcome`-returning function.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}
