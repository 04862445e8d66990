//! Lazy flush: queue the writes now, apply them later.
//!
//! [`flush_lazy`] runs the session's lifecycle hooks and required-column
//! checks, then pushes one message to the lazy queue and returns. Nothing
//! reaches storage or the cache tiers until a [`LazyReceiver`] digests the
//! message and replays it through the normal flush path, with full
//! validation. Until then, reads see the old state.

use asupersync::{Cx, Outcome};
use tierdb_cache::Engine;
use tierdb_core::{Connection, Error, RemoteCache, try_outcome, try_result};
use tierdb_session::{FlushOptions, FlushSummary, Flusher, Session, check_required};

use crate::wire::QueuedBatch;
use crate::{ack_message, dead_letter, peek_message, push_messages, queue_size};

/// Queue every dirty entity of a session for a later write.
///
/// Returns how many row writes were queued. Updated entities count as
/// flushed afterwards; new ones are detached since their id is assigned
/// by the consumer; deleted ones leave the session.
pub async fn flush_lazy<S: Connection, R: RemoteCache>(
    session: &mut Session<S, R>,
    cx: &Cx,
) -> Outcome<usize, Error> {
    flush_lazy_with(session, cx, FlushOptions::default()).await
}

/// [`flush_lazy`] with an explicit subset or on-duplicate behavior.
#[tracing::instrument(level = "info", skip_all)]
pub async fn flush_lazy_with<S: Connection, R: RemoteCache>(
    session: &mut Session<S, R>,
    cx: &Cx,
    options: FlushOptions,
) -> Outcome<usize, Error> {
    let ops = try_result!(session.pending_ops(&options));
    if ops.is_empty() {
        return Outcome::Ok(0);
    }
    for op in &ops {
        try_result!(check_required(op));
    }

    let batch = QueuedBatch::from_ops(&ops).on_duplicate_update(options.on_duplicate_update);
    let payload = try_result!(batch.encode());
    let engine = session.engine().clone();
    let queue = engine.config().lazy_queue.clone();
    let depth = try_outcome!(push_messages(&engine, cx, &queue, vec![payload]).await);
    tracing::info!(
        target: "tierdb::queue",
        queue = %queue,
        ops = ops.len(),
        depth,
        "Queued lazy flush"
    );

    session.mark_queued(&ops);
    Outcome::Ok(ops.len())
}

/// Consumer side of the lazy queue.
///
/// Run one receiver per queue at a time; guard it with a distributed lock
/// when several processes could digest the same queue.
#[derive(Debug, Clone)]
pub struct LazyReceiver<S, R> {
    engine: Engine<S, R>,
    queue: String,
}

impl<S: Connection, R: RemoteCache> LazyReceiver<S, R> {
    pub fn new(engine: &Engine<S, R>) -> Self {
        Self {
            queue: engine.config().lazy_queue.clone(),
            engine: engine.clone(),
        }
    }

    /// Consume a differently named queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Messages waiting in the queue.
    pub async fn size(&self, cx: &Cx) -> Outcome<u64, Error> {
        queue_size(&self.engine, cx, &self.queue).await
    }

    /// Apply the oldest queued message.
    ///
    /// Returns `None` when the queue is empty. A message that cannot be
    /// decoded or fails validation is moved to the dead-letter queue and
    /// its error returned. The message leaves the queue only once it was
    /// applied or dead-lettered; a cancelled digest leaves it at the head.
    #[tracing::instrument(level = "info", skip(self, cx), fields(queue = %self.queue))]
    pub async fn digest(&self, cx: &Cx) -> Outcome<Option<FlushSummary>, Error> {
        let Some(raw) = try_outcome!(peek_message(&self.engine, cx, &self.queue).await) else {
            return Outcome::Ok(None);
        };

        let decoded = QueuedBatch::decode(&raw).and_then(|batch| {
            let on_duplicate_update = batch.on_duplicate_update;
            batch
                .into_ops(&self.engine)
                .map(|ops| (ops, on_duplicate_update))
        });
        let (ops, on_duplicate_update) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => return self.reject(cx, raw, e).await,
        };

        let replay = Flusher::new(&self.engine)
            .on_duplicate_update(on_duplicate_update)
            .flush(cx, ops)
            .await;
        match replay {
            Outcome::Ok(applied) => {
                try_outcome!(ack_message(&self.engine, cx, &self.queue, &raw).await);
                let summary = FlushSummary::of(&applied);
                tracing::debug!(
                    target: "tierdb::queue",
                    queue = %self.queue,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "Digested lazy message"
                );
                Outcome::Ok(Some(summary))
            }
            Outcome::Err(e) => self.reject(cx, raw, e).await,
            Outcome::Cancelled(reason) => {
                tracing::debug!(
                    target: "tierdb::queue",
                    queue = %self.queue,
                    "Digest cancelled, message stays queued"
                );
                Outcome::Cancelled(reason)
            }
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Digest until the queue is empty or `max` messages were applied.
    ///
    /// Stops at the first failing message.
    pub async fn digest_all(&self, cx: &Cx, max: usize) -> Outcome<usize, Error> {
        let mut applied = 0;
        while applied < max {
            match try_outcome!(self.digest(cx).await) {
                Some(_) => applied += 1,
                None => break,
            }
        }
        Outcome::Ok(applied)
    }

    async fn reject(&self, cx: &Cx, raw: String, error: Error) -> Outcome<Option<FlushSummary>, Error> {
        try_outcome!(dead_letter(&self.engine, cx, &self.queue, raw, &error).await);
        Outcome::Err(error)
    }
}
