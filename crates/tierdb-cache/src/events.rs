//! Change-data-capture events.
//!
//! A flush publishes at most one [`DirtyEvent`] per channel, listing every
//! affected row of every type opted into that channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use tierdb_core::{Connection, Error, RemoteCache, try_outcome, try_result};

use crate::changes::{ChangeKind, RowChange};
use crate::engine::Engine;
use crate::registry::EntityMeta;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyEntry {
    pub entity: String,
    pub id: u64,
    pub kind: ChangeKind,
}

/// One flush worth of changes on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyEvent {
    pub channel: String,
    pub entries: Vec<DirtyEntry>,
}

/// Group changes into per-channel events.
///
/// Updates only count for a channel restricted to a column subset when
/// one of those columns changed.
pub fn collect_dirty_events(changes: &[(Arc<EntityMeta>, RowChange)]) -> Vec<DirtyEvent> {
    let mut by_channel: BTreeMap<&str, Vec<DirtyEntry>> = BTreeMap::new();
    for (meta, change) in changes {
        for channel in &meta.schema.dirty_channels {
            let relevant = change.kind != ChangeKind::Update
                || channel.columns.is_empty()
                || channel
                    .columns
                    .iter()
                    .any(|column| change.column_changed(meta, column));
            if relevant {
                by_channel.entry(channel.name).or_default().push(DirtyEntry {
                    entity: meta.name.to_string(),
                    id: change.id,
                    kind: change.kind,
                });
            }
        }
    }
    by_channel
        .into_iter()
        .map(|(channel, entries)| DirtyEvent {
            channel: channel.to_string(),
            entries,
        })
        .collect()
}

impl<S: Connection, R: RemoteCache> Engine<S, R> {
    /// Publish the dirty events of one flush. Returns how many were sent.
    pub async fn publish_dirty(
        &self,
        cx: &Cx,
        changes: &[(Arc<EntityMeta>, RowChange)],
    ) -> Outcome<usize, Error> {
        let events = collect_dirty_events(changes);
        if events.is_empty() {
            return Outcome::Ok(0);
        }
        let pool = try_result!(self.queue_pool());
        let conn = try_outcome!(pool.acquire(cx).await);
        for event in &events {
            let stream = self.config().dirty_stream(&event.channel);
            let payload = try_result!(serde_json::to_string(event));
            let entry_id = try_outcome!(conn.xadd(cx, &stream, payload).await);
            tracing::debug!(
                target: "tierdb::queue",
                stream = %stream,
                entry = %entry_id,
                rows = event.entries.len(),
                "published dirty event"
            );
        }
        Outcome::Ok(events.len())
    }
}
