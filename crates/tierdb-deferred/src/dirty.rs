//! Dirty-event (change-data-capture) consumer.
//!
//! Every flush appends at most one [`DirtyEvent`] per channel to that
//! channel's stream. A [`DirtyReceiver`] reads the oldest events and only
//! acknowledges the ones its handler accepted, so a failing handler sees
//! the same event again on the next digest.

use asupersync::{Cx, Outcome};
use tierdb_cache::{DirtyEvent, Engine};
use tierdb_core::{Connection, Error, RemoteCache, Result, try_outcome, try_result};

#[derive(Debug, Clone)]
pub struct DirtyReceiver<S, R> {
    engine: Engine<S, R>,
    channel: String,
    stream: String,
}

impl<S: Connection, R: RemoteCache> DirtyReceiver<S, R> {
    pub fn new(engine: &Engine<S, R>, channel: &str) -> Self {
        Self {
            engine: engine.clone(),
            channel: channel.to_string(),
            stream: engine.config().dirty_stream(channel),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Events waiting on the channel.
    pub async fn size(&self, cx: &Cx) -> Outcome<u64, Error> {
        let pool = try_result!(self.engine.queue_pool());
        let conn = try_outcome!(pool.acquire(cx).await);
        conn.xlen(cx, &self.stream).await
    }

    /// Hand up to `max` of the oldest events to `handler`, in order.
    ///
    /// Stops at the first event the handler rejects; events handled before
    /// it are acknowledged, it and later ones stay queued. Returns how many
    /// were acknowledged.
    #[tracing::instrument(level = "info", skip(self, cx, handler), fields(channel = %self.channel))]
    pub async fn digest<F>(&self, cx: &Cx, max: usize, mut handler: F) -> Outcome<usize, Error>
    where
        F: FnMut(&DirtyEvent) -> Result<()>,
    {
        let pool = try_result!(self.engine.queue_pool());
        let conn = try_outcome!(pool.acquire(cx).await);
        let entries = try_outcome!(conn.xrange(cx, &self.stream, max).await);

        let mut handled = Vec::with_capacity(entries.len());
        let mut failure = None;
        for (entry_id, payload) in entries {
            let result = serde_json::from_str::<DirtyEvent>(&payload)
                .map_err(Error::from)
                .and_then(|event| handler(&event));
            match result {
                Ok(()) => handled.push(entry_id),
                Err(e) => {
                    tracing::warn!(
                        target: "tierdb::queue",
                        stream = %self.stream,
                        entry = %entry_id,
                        error = %e,
                        "Dirty event handler failed"
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        if !handled.is_empty() {
            try_outcome!(conn.xdel(cx, &self.stream, &handled).await);
        }
        tracing::debug!(
            target: "tierdb::queue",
            stream = %self.stream,
            acknowledged = handled.len(),
            "Digested dirty events"
        );
        match failure {
            Some(e) => Outcome::Err(e),
            None => Outcome::Ok(handled.len()),
        }
    }
}
