//! Change tracking and dirty detection for a session.
//!
//! Snapshots hold the column values an entity had when it was loaded or
//! last flushed. An entity is dirty when its current values differ from
//! the snapshot. New entities have no snapshot and are always dirty.

use std::collections::HashMap;
use std::time::Instant;

use tierdb_cache::EntityMeta;
use tierdb_core::Value;

use crate::identity_map::ObjectKey;

/// Snapshot of an entity's column values at a point in time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    values: Vec<Value>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    /// Column values in schema order; includes the fake-delete flag.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Tracks snapshots for every slot of a session.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<ObjectKey, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the values `key` was loaded or flushed with.
    pub fn snapshot(&mut self, key: ObjectKey, values: Vec<Value>) {
        tracing::trace!(slot = key.slot(), columns = values.len(), "Taking object snapshot");
        self.snapshots.insert(key, ObjectSnapshot::new(values));
    }

    /// Has `current` drifted from the snapshot? Missing snapshot means dirty.
    pub fn is_dirty(&self, key: &ObjectKey, current: &[Value]) -> bool {
        let Some(snapshot) = self.snapshots.get(key) else {
            return true;
        };
        snapshot.values.len() != current.len()
            || snapshot
                .values
                .iter()
                .zip(current)
                .any(|(before, after)| !before.loose_eq(after))
    }

    /// Names of columns whose value differs from the snapshot.
    pub fn changed_columns(
        &self,
        key: &ObjectKey,
        meta: &EntityMeta,
        current: &[Value],
    ) -> Vec<&'static str> {
        let Some(snapshot) = self.snapshots.get(key) else {
            return meta.columns().to_vec();
        };
        meta.columns()
            .iter()
            .enumerate()
            .filter(|(pos, _)| {
                match (snapshot.values.get(*pos), current.get(*pos)) {
                    (Some(before), Some(after)) => !before.loose_eq(after),
                    _ => true,
                }
            })
            .map(|(_, column)| *column)
            .collect()
    }

    pub fn has_snapshot(&self, key: &ObjectKey) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn get_snapshot(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> {
        self.snapshots.get(key)
    }

    pub fn clear(&mut self, key: &ObjectKey) {
        self.snapshots.remove(key);
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_map::{IdentityMap, ObjectState, TrackedObject};
    use std::sync::Arc;
    use tierdb_cache::Hooks;
    use tierdb_core::{Column, Entity, EntitySchema, Result, Row, SqlType};

    struct Hero {
        id: u64,
        name: String,
        age: i32,
    }

    impl Entity for Hero {
        const ENTITY_NAME: &'static str = "Hero";

        fn schema() -> EntitySchema {
            EntitySchema::new("heroes")
                .column(Column::new("name", SqlType::Text))
                .column(Column::new("age", SqlType::Integer))
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("name", Value::from(self.name.as_str())),
                ("age", Value::Int(self.age)),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                name: row.get_named("name")?,
                age: row.get_named("age")?,
            })
        }
    }

    fn key() -> ObjectKey {
        let meta = Arc::new(EntityMeta::for_type::<Hero>(Hooks::default()));
        let hero = Hero {
            id: 1,
            name: "a".into(),
            age: 3,
        };
        IdentityMap::new()
            .insert(TrackedObject::new(meta, Box::new(hero), ObjectState::Persistent))
            .0
    }

    #[test]
    fn no_snapshot_is_dirty() {
        let tracker = ChangeTracker::new();
        assert!(tracker.is_dirty(&key(), &[Value::from("a")]));
    }

    #[test]
    fn integer_width_is_not_a_change() {
        let mut tracker = ChangeTracker::new();
        let key = key();
        tracker.snapshot(key, vec![Value::from("a"), Value::BigInt(3)]);
        assert!(!tracker.is_dirty(&key, &[Value::from("a"), Value::Int(3)]));
        assert!(tracker.is_dirty(&key, &[Value::from("a"), Value::Int(4)]));
    }

    #[test]
    fn changed_columns_lists_differences() {
        let meta = EntityMeta::for_type::<Hero>(Hooks::default());
        let mut tracker = ChangeTracker::new();
        let key = key();
        tracker.snapshot(key, vec![Value::from("a"), Value::Int(3)]);
        let changed = tracker.changed_columns(&key, &meta, &[Value::from("b"), Value::Int(3)]);
        assert_eq!(changed, vec!["name"]);

        tracker.clear(&key);
        assert_eq!(
            tracker.changed_columns(&key, &meta, &[Value::from("b"), Value::Int(3)]),
            vec!["name", "age"]
        );
    }
}
