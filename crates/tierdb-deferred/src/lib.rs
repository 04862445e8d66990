//! Deferred write paths for tierdb.
//!
//! - **Lazy flush** ([`flush_lazy`]): the whole flush is queued and applied
//!   later by a [`LazyReceiver`].
//! - **Cache-ahead flush** ([`flush_cache_ahead`]): updates land in the
//!   cache tiers at once and reach storage through a [`CacheAheadReceiver`].
//! - **Dirty events** ([`DirtyReceiver`]): consumers of the per-channel
//!   change streams every flush publishes to.
//!
//! Queues live on the engine's queue pool, a remote cache backend. A queue
//! has one consumer at a time; coordinate consumers across processes with
//! `tierdb-lock`.
//!
//! Receivers read the head of a queue, apply it, and only then remove it.
//! A digest that is cancelled or interrupted leaves its message queued, so
//! delivery is at least once: a message whose writes partly landed before
//! the interruption is applied again by the next digest.

pub mod cache_ahead;
pub mod dirty;
pub mod lazy;
pub mod wire;

pub use cache_ahead::{CacheAheadReceiver, flush_cache_ahead};
pub use dirty::DirtyReceiver;
pub use lazy::{LazyReceiver, flush_lazy, flush_lazy_with};
pub use wire::{QueuedBatch, QueuedOperation};

use asupersync::{Cx, Outcome};
use tierdb_cache::{Engine, EngineConfig};
use tierdb_core::{Connection, Error, RemoteCache, try_outcome, try_result};

pub(crate) async fn push_messages<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    cx: &Cx,
    queue: &str,
    payloads: Vec<String>,
) -> Outcome<u64, Error> {
    let pool = try_result!(engine.queue_pool());
    let conn = try_outcome!(pool.acquire(cx).await);
    conn.rpush(cx, queue, payloads).await
}

/// The oldest message, left in place until [`ack_message`] removes it.
pub(crate) async fn peek_message<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    cx: &Cx,
    queue: &str,
) -> Outcome<Option<String>, Error> {
    let pool = try_result!(engine.queue_pool());
    let conn = try_outcome!(pool.acquire(cx).await);
    conn.lindex(cx, queue, 0).await
}

pub(crate) async fn ack_message<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    cx: &Cx,
    queue: &str,
    raw: &str,
) -> Outcome<(), Error> {
    let pool = try_result!(engine.queue_pool());
    let conn = try_outcome!(pool.acquire(cx).await);
    if !try_outcome!(conn.lrem(cx, queue, raw).await) {
        tracing::warn!(
            target: "tierdb::queue",
            queue = %queue,
            "Applied message was already gone from the queue"
        );
    }
    Outcome::Ok(())
}

pub(crate) async fn queue_size<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    cx: &Cx,
    queue: &str,
) -> Outcome<u64, Error> {
    let pool = try_result!(engine.queue_pool());
    let conn = try_outcome!(pool.acquire(cx).await);
    conn.llen(cx, queue).await
}

/// Move a message that could not be applied to `<queue>:failed`.
///
/// The copy lands in the dead-letter queue before the original is
/// removed, so an interruption in between leaves it in both.
pub(crate) async fn dead_letter<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    cx: &Cx,
    queue: &str,
    raw: String,
    error: &Error,
) -> Outcome<(), Error> {
    let failed = EngineConfig::failed_queue(queue);
    tracing::warn!(
        target: "tierdb::queue",
        queue = %queue,
        dead_letter = %failed,
        error = %error,
        "Queued message rejected"
    );
    try_outcome!(push_messages(engine, cx, &failed, vec![raw.clone()]).await);
    ack_message(engine, cx, queue, &raw).await
}
