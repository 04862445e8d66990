//! Queue message format shared by the lazy and cache-ahead writers.
//!
//! A lazy message is one flush worth of row writes ([`QueuedBatch`]); a
//! cache-ahead message is a single row ([`QueuedOperation`]). Both are
//! JSON. Each operation carries the fingerprint of the type layout it was
//! produced with; a consumer running a different layout refuses the
//! message.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tierdb_cache::{ChangeKind, Engine, EntityMeta};
use tierdb_core::{Connection, Error, RemoteCache, Result, SchemaError, SchemaErrorKind, Value};
use tierdb_session::PendingOp;

/// One queued row write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub entity: String,
    pub fingerprint: String,
    pub kind: ChangeKind,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<Vec<Value>>,
}

impl QueuedOperation {
    pub fn from_op(op: &PendingOp) -> Self {
        Self {
            entity: op.entity().to_string(),
            fingerprint: op.meta.fingerprint.clone(),
            kind: op.kind,
            id: op.id,
            prior: op.prior.clone(),
            current: op.current.clone(),
        }
    }

    /// Rebuild the pending write against a consumer's engine.
    #[allow(clippy::result_large_err)]
    pub fn into_op<S: Connection, R: RemoteCache>(self, engine: &Engine<S, R>) -> Result<PendingOp> {
        let meta = engine.meta_by_name(&self.entity)?;
        check_layout(&meta, &self.fingerprint)?;
        Ok(PendingOp {
            meta,
            kind: self.kind,
            id: self.id,
            prior: self.prior,
            current: self.current,
            key: None,
            cascaded: false,
        })
    }

    #[allow(clippy::result_large_err)]
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    #[allow(clippy::result_large_err)]
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[allow(clippy::result_large_err)]
fn check_layout(meta: &Arc<EntityMeta>, fingerprint: &str) -> Result<()> {
    if meta.fingerprint == fingerprint {
        return Ok(());
    }
    Err(Error::Schema(SchemaError {
        kind: SchemaErrorKind::Invalid,
        message: format!(
            "queued {} was written with layout {}, this process uses {}",
            meta.name, fingerprint, meta.fingerprint
        ),
    }))
}

/// A queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedBatch {
    pub ops: Vec<QueuedOperation>,
    #[serde(default)]
    pub on_duplicate_update: bool,
}

impl QueuedBatch {
    pub fn from_ops(ops: &[PendingOp]) -> Self {
        Self {
            ops: ops.iter().map(QueuedOperation::from_op).collect(),
            on_duplicate_update: false,
        }
    }

    pub fn on_duplicate_update(mut self, enabled: bool) -> Self {
        self.on_duplicate_update = enabled;
        self
    }

    #[allow(clippy::result_large_err)]
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    #[allow(clippy::result_large_err)]
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    #[allow(clippy::result_large_err)]
    pub fn into_ops<S: Connection, R: RemoteCache>(self, engine: &Engine<S, R>) -> Result<Vec<PendingOp>> {
        self.ops.into_iter().map(|op| op.into_op(engine)).collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
