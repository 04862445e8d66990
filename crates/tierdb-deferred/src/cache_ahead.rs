//! Cache-ahead flush: cache tiers now, storage later.
//!
//! Updates of types with a remote tier are validated, written into the
//! cache tiers, and queued one row per message; storage catches up when a
//! [`CacheAheadReceiver`] digests the queue. Reads through the cache see
//! the new values at once. Inserts and deletes, and updates of types
//! without a remote tier, take the synchronous path in the same call.
//!
//! The receiver writes what the remote tier holds for the row when it
//! digests, not the values frozen in the message, so a synchronous flush
//! of the same row in the meantime is not undone.

use std::sync::Arc;

use asupersync::{Cx, Outcome};
use tierdb_cache::{CacheEntry, Engine};
use tierdb_core::{Connection, Error, RemoteCache, Value, try_outcome, try_result};
use tierdb_session::{FlushOptions, FlushPlan, FlushSummary, Flusher, PendingOp, Session};

use crate::wire::QueuedOperation;
use crate::{ack_message, dead_letter, peek_message, push_messages, queue_size};

/// Flush a session, deferring eligible updates to the cache-ahead queue.
///
/// The synchronous part is written first. Tracked state changes only when
/// every part succeeded; on failure nothing of the cache-ahead part stays
/// queued or cached.
#[tracing::instrument(level = "info", skip_all)]
pub async fn flush_cache_ahead<S: Connection, R: RemoteCache>(
    session: &mut Session<S, R>,
    cx: &Cx,
) -> Outcome<FlushSummary, Error> {
    let ops = try_result!(session.pending_ops(&FlushOptions::default()));
    if ops.is_empty() {
        return Outcome::Ok(FlushSummary::default());
    }
    let engine = session.engine().clone();
    let flusher = Flusher::new(&engine);

    // Validate the whole batch before either path writes anything.
    let ops = try_outcome!(flusher.validate(cx, ops).await);
    let (ahead, direct): (Vec<PendingOp>, Vec<PendingOp>) = ops
        .into_iter()
        .partition(|op| op.is_update() && engine.has_remote_tier(&op.meta));

    let applied = if direct.is_empty() {
        Vec::new()
    } else {
        try_outcome!(flusher.flush(cx, direct).await)
    };
    let cached = if ahead.is_empty() {
        Vec::new()
    } else {
        try_outcome!(write_ahead(&engine, &flusher, cx, ahead).await)
    };

    session.mark_flushed(&applied);
    session.mark_flushed(&cached);
    let mut written = applied;
    written.extend(cached);
    Outcome::Ok(FlushSummary::of(&written))
}

/// Write updates to the cache tiers and queue one message per row.
///
/// If anything fails the rows are dropped from the cache again so readers
/// fall back to storage.
async fn write_ahead<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    flusher: &Flusher<'_, S, R>,
    cx: &Cx,
    ahead: Vec<PendingOp>,
) -> Outcome<Vec<PendingOp>, Error> {
    let touched = ahead.clone();
    let outcome = cache_and_enqueue(engine, flusher, cx, ahead).await;
    if !matches!(outcome, Outcome::Ok(_)) {
        if let Outcome::Err(e) = flusher.forget(cx, &touched).await {
            tracing::warn!(
                target: "tierdb::cache",
                rows = touched.len(),
                error = %e,
                "Could not drop cache-ahead rows after a failed flush"
            );
        }
    }
    outcome
}

/// The messages go out in a single push.
async fn cache_and_enqueue<S: Connection, R: RemoteCache>(
    engine: &Engine<S, R>,
    flusher: &Flusher<'_, S, R>,
    cx: &Cx,
    ahead: Vec<PendingOp>,
) -> Outcome<Vec<PendingOp>, Error> {
    let cached = try_outcome!(flusher.flush_to_cache(cx, ahead).await);
    let payloads = try_result!(
        cached
            .iter()
            .map(|op| QueuedOperation::from_op(op).encode())
            .collect::<tierdb_core::Result<Vec<String>>>()
    );
    let queue = &engine.config().cache_ahead_queue;
    let depth = try_outcome!(push_messages(engine, cx, queue, payloads).await);
    tracing::info!(
        target: "tierdb::queue",
        queue = %queue,
        rows = cached.len(),
        depth,
        "Queued cache-ahead writes"
    );
    Outcome::Ok(cached)
}

/// Consumer side of the cache-ahead queue.
#[derive(Debug, Clone)]
pub struct CacheAheadReceiver<S, R> {
    engine: Engine<S, R>,
    queue: String,
}

impl<S: Connection, R: RemoteCache> CacheAheadReceiver<S, R> {
    pub fn new(engine: &Engine<S, R>) -> Self {
        Self {
            queue: engine.config().cache_ahead_queue.clone(),
            engine: engine.clone(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub async fn size(&self, cx: &Cx) -> Outcome<u64, Error> {
        queue_size(&self.engine, cx, &self.queue).await
    }

    /// Bring storage up to date for the row named by the oldest message.
    ///
    /// Returns `None` on an empty queue, otherwise the number of rows
    /// written: 0 when storage already matched or the row is gone.
    ///
    /// Cached lists rebuilt while the message waited may hold pre-write
    /// results, so they are dropped again; dirty events go out now. When
    /// the storage write fails the cached row is dropped too, and the
    /// message moves to the dead-letter queue. A cancelled digest leaves
    /// the message queued.
    #[tracing::instrument(level = "info", skip(self, cx), fields(queue = %self.queue))]
    pub async fn digest(&self, cx: &Cx) -> Outcome<Option<usize>, Error> {
        let Some(raw) = try_outcome!(peek_message(&self.engine, cx, &self.queue).await) else {
            return Outcome::Ok(None);
        };
        let op = match QueuedOperation::decode(&raw).and_then(|op| op.into_op(&self.engine)) {
            Ok(op) => op,
            Err(e) => {
                try_outcome!(dead_letter(&self.engine, cx, &self.queue, raw, &e).await);
                return Outcome::Err(e);
            }
        };

        let (entity, id) = (op.entity(), op.id);
        let Some(write) = try_outcome!(self.resolve(cx, op).await) else {
            try_outcome!(ack_message(&self.engine, cx, &self.queue, &raw).await);
            tracing::debug!(
                target: "tierdb::queue",
                queue = %self.queue,
                entity,
                id,
                "Storage already current, nothing to write"
            );
            return Outcome::Ok(Some(0));
        };

        let flusher = Flusher::new(&self.engine);
        let plan = FlushPlan {
            updates: vec![write.clone()],
            ..FlushPlan::default()
        };
        match flusher.execute(cx, plan).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => {
                if let Outcome::Err(forget) = flusher.forget(cx, std::slice::from_ref(&write)).await {
                    tracing::warn!(
                        target: "tierdb::cache",
                        entity,
                        id,
                        error = %forget,
                        "Could not drop cached row after a failed write"
                    );
                }
                try_outcome!(dead_letter(&self.engine, cx, &self.queue, raw, &e).await);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(reason) => {
                tracing::debug!(
                    target: "tierdb::queue",
                    queue = %self.queue,
                    "Digest cancelled, message stays queued"
                );
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let change = write.row_change();
        try_outcome!(
            self.engine
                .invalidate_indexes(cx, &write.meta, std::slice::from_ref(&change))
                .await
        );
        try_outcome!(
            self.engine
                .publish_dirty(cx, &[(Arc::clone(&write.meta), change)])
                .await
        );
        try_outcome!(ack_message(&self.engine, cx, &self.queue, &raw).await);

        tracing::debug!(
            target: "tierdb::queue",
            queue = %self.queue,
            entity,
            id,
            "Digested cache-ahead message"
        );
        Outcome::Ok(Some(1))
    }

    /// Work out the update storage still needs for a queued row.
    ///
    /// The remote tier holds the newest value: a synchronous flush after
    /// the cache-ahead one rewrote it there too. When the tier lost the
    /// entry, the queued values are used only if storage still holds what
    /// the queued update started from.
    async fn resolve(&self, cx: &Cx, op: PendingOp) -> Outcome<Option<PendingOp>, Error> {
        let mut stored = try_outcome!(
            self.engine
                .load_from_storage(cx, &op.meta, &[op.id])
                .await
        );
        let Some(stored) = stored.remove(&op.id) else {
            return Outcome::Ok(None);
        };

        let target = match try_outcome!(self.engine.remote_entry(cx, &op.meta, op.id).await) {
            Some(CacheEntry::Row(values)) => values,
            Some(CacheEntry::Missing | CacheEntry::Ids(_)) => return Outcome::Ok(None),
            None => match (op.prior, op.current) {
                (Some(prior), Some(current)) if same_values(&prior, &stored) => current,
                _ => return Outcome::Ok(None),
            },
        };

        let write = PendingOp::update(Arc::clone(&op.meta), op.id, stored, target);
        if write.changed_columns().is_empty() {
            return Outcome::Ok(None);
        }
        Outcome::Ok(Some(write))
    }

    /// Digest until the queue is empty or `max` messages were handled.
    pub async fn digest_all(&self, cx: &Cx, max: usize) -> Outcome<usize, Error> {
        let mut handled = 0;
        while handled < max {
            match try_outcome!(self.digest(cx).await) {
                Some(_) => handled += 1,
                None => break,
            }
        }
        Outcome::Ok(handled)
    }
}

fn same_values(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
}
