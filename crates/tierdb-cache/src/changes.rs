//! Row-level change records produced by a flush.

use serde::{Deserialize, Serialize};
use tierdb_core::Value;

use crate::registry::EntityMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One row written by a flush, with its column values before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub id: u64,
    /// Last known values; `None` for inserts.
    pub prior: Option<Vec<Value>>,
    /// Written values; `None` for physical deletes.
    pub current: Option<Vec<Value>>,
}

impl RowChange {
    pub fn insert(id: u64, current: Vec<Value>) -> Self {
        Self {
            kind: ChangeKind::Insert,
            id,
            prior: None,
            current: Some(current),
        }
    }

    pub fn update(id: u64, prior: Vec<Value>, current: Vec<Value>) -> Self {
        Self {
            kind: ChangeKind::Update,
            id,
            prior: Some(prior),
            current: Some(current),
        }
    }

    pub fn delete(id: u64, prior: Vec<Value>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            id,
            prior: Some(prior),
            current: None,
        }
    }

    /// Did `column` change between prior and current values?
    pub fn column_changed(&self, meta: &EntityMeta, column: &str) -> bool {
        match (&self.prior, &self.current) {
            (Some(prior), Some(current)) => {
                let before = meta.value_in(self.id, prior, column);
                let after = meta.value_in(self.id, current, column);
                !before.loose_eq(&after)
            }
            _ => true,
        }
    }

    /// Did the fake-delete flag flip?
    pub fn fake_delete_flipped(&self, meta: &EntityMeta) -> bool {
        match (&self.prior, &self.current) {
            (Some(prior), Some(current)) => {
                meta.is_fake_deleted(prior) != meta.is_fake_deleted(current)
            }
            _ => false,
        }
    }
}
