//! Identity Map pattern for tracking unique entity instances per primary key.
//!
//! Each `(type, id)` pair maps to exactly one tracked slot within a session,
//! so loading or tracking the same row twice always yields the same handle.
//! Entities that have no id yet (new, id 0) get their own slot and join
//! the index once a flush assigns them an id.
//!
//! The map owns the entities. Callers address them through [`Handle`]s,
//! which are plain copyable slot numbers tagged with the entity type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tierdb_cache::EntityMeta;
use tierdb_core::Entity;

/// Untyped address of a tracked slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    slot: usize,
    type_id: TypeId,
}

impl ObjectKey {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

/// Typed handle to an entity tracked by a session.
///
/// Handles are only meaningful for the session that issued them.
pub struct Handle<E> {
    key: ObjectKey,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for Handle<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Handle<E> {}

impl<E> PartialEq for Handle<E> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<E> Eq for Handle<E> {}

impl<E> std::hash::Hash for Handle<E> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<E> std::fmt::Debug for Handle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("type", &std::any::type_name::<E>())
            .field("slot", &self.key.slot)
            .finish()
    }
}

impl<E: Entity> Handle<E> {
    pub(crate) fn new(key: ObjectKey) -> Self {
        Self {
            key,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }
}

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Constructed in this session, not yet inserted.
    New,
    /// Loaded from, or written to, storage.
    Persistent,
    /// Physically deleted by a flush.
    Deleted,
    /// Handed to a deferred writer; the session no longer owns its state.
    Detached,
}

/// One tracked entity.
pub struct TrackedObject {
    pub(crate) meta: Arc<EntityMeta>,
    pub(crate) object: Box<dyn Any + Send + Sync>,
    pub(crate) state: ObjectState,
    /// Logical deletion flag, kept outside the record.
    pub(crate) fake_deleted: bool,
    /// Physical deletion requested for the next flush.
    pub(crate) delete_requested: bool,
}

impl TrackedObject {
    pub(crate) fn new(meta: Arc<EntityMeta>, object: Box<dyn Any + Send + Sync>, state: ObjectState) -> Self {
        Self {
            meta,
            object,
            state,
            fake_deleted: false,
            delete_requested: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id_of(self.object.as_ref())
    }

    pub fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }
}

impl std::fmt::Debug for TrackedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedObject")
            .field("entity", &self.meta.name)
            .field("id", &self.id())
            .field("state", &self.state)
            .field("fake_deleted", &self.fake_deleted)
            .field("delete_requested", &self.delete_requested)
            .finish()
    }
}

/// Identity Map for tracking unique entity instances.
#[derive(Debug, Default)]
pub struct IdentityMap {
    slots: Vec<Option<TrackedObject>>,
    index: HashMap<(TypeId, u64), usize>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot already holding `(type_id, id)`, if any.
    pub fn find(&self, type_id: TypeId, id: u64) -> Option<ObjectKey> {
        if id == 0 {
            return None;
        }
        self.index
            .get(&(type_id, id))
            .map(|slot| ObjectKey { slot: *slot, type_id })
    }

    /// Track an object, or return the slot already tracking its identity.
    ///
    /// Returns the key and whether a new slot was created. When the
    /// identity is already tracked the given object is dropped.
    pub fn insert(&mut self, tracked: TrackedObject) -> (ObjectKey, bool) {
        let type_id = tracked.meta.type_id;
        let id = tracked.id();
        if let Some(existing) = self.find(type_id, id) {
            return (existing, false);
        }
        let slot = self.slots.len();
        self.slots.push(Some(tracked));
        if id != 0 {
            self.index.insert((type_id, id), slot);
        }
        (ObjectKey { slot, type_id }, true)
    }

    /// Point `(type, id)` at `key`. A different slot holding that identity
    /// is detached and returned.
    pub fn reindex(&mut self, key: ObjectKey, id: u64) -> Option<ObjectKey> {
        let previous = self.index.insert((key.type_id, id), key.slot);
        match previous {
            Some(slot) if slot != key.slot => {
                if let Some(Some(other)) = self.slots.get_mut(slot) {
                    other.state = ObjectState::Detached;
                }
                Some(ObjectKey {
                    slot,
                    type_id: key.type_id,
                })
            }
            _ => None,
        }
    }

    /// Drop the identity entry of a slot; the slot itself stays addressable.
    pub fn unindex(&mut self, key: ObjectKey, id: u64) {
        if self.index.get(&(key.type_id, id)) == Some(&key.slot) {
            self.index.remove(&(key.type_id, id));
        }
    }

    pub fn get(&self, key: ObjectKey) -> Option<&TrackedObject> {
        self.slots.get(key.slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, key: ObjectKey) -> Option<&mut TrackedObject> {
        self.slots.get_mut(key.slot).and_then(Option::as_mut)
    }

    /// Typed access to a tracked entity.
    pub fn entity<E: Entity>(&self, handle: Handle<E>) -> Option<&E> {
        self.get(handle.key())
            .and_then(|t| t.object.downcast_ref::<E>())
    }

    pub fn entity_mut<E: Entity>(&mut self, handle: Handle<E>) -> Option<&mut E> {
        self.get_mut(handle.key())
            .and_then(|t| t.object.downcast_mut::<E>())
    }

    /// Keys of every live slot, in tracking order.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, t)| {
                t.as_ref().map(|t| ObjectKey {
                    slot,
                    type_id: t.meta.type_id,
                })
            })
            .collect()
    }

    /// Number of indexed identities.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Number of tracked slots, including new entities without an id.
    pub fn slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierdb_cache::Hooks;
    use tierdb_core::{Column, EntitySchema, Result, Row, SqlType, Value};

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: u64,
        label: String,
    }

    impl Entity for Tag {
        const ENTITY_NAME: &'static str = "Tag";

        fn schema() -> EntitySchema {
            EntitySchema::new("tags").column(Column::new("label", SqlType::Text))
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("label", Value::from(self.label.as_str()))]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                label: row.get_named("label")?,
            })
        }
    }

    fn tracked(id: u64, label: &str) -> TrackedObject {
        let meta = Arc::new(EntityMeta::for_type::<Tag>(Hooks::default()));
        TrackedObject::new(
            meta,
            Box::new(Tag {
                id,
                label: label.to_string(),
            }),
            ObjectState::Persistent,
        )
    }

    #[test]
    fn same_identity_returns_same_slot() {
        let mut map = IdentityMap::new();
        let (a, created) = map.insert(tracked(7, "first"));
        assert!(created);
        let (b, created) = map.insert(tracked(7, "second"));
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(map.len(), 1);

        let handle = Handle::<Tag>::new(a);
        assert_eq!(map.entity(handle).map(|t| t.label.as_str()), Some("first"));
    }

    #[test]
    fn new_entities_get_separate_slots() {
        let mut map = IdentityMap::new();
        let (a, _) = map.insert(tracked(0, "a"));
        let (b, _) = map.insert(tracked(0, "b"));
        assert_ne!(a, b);
        assert_eq!(map.len(), 0);
        assert_eq!(map.slot_count(), 2);

        assert_eq!(map.reindex(a, 12), None);
        assert_eq!(map.find(TypeId::of::<Tag>(), 12), Some(a));
    }

    #[test]
    fn reindex_detaches_previous_holder() {
        let mut map = IdentityMap::new();
        let (old, _) = map.insert(tracked(3, "old"));
        let (new, _) = map.insert(tracked(0, "new"));
        assert_eq!(map.reindex(new, 3), Some(old));
        assert_eq!(map.get(old).map(TrackedObject::state), Some(ObjectState::Detached));
        assert_eq!(map.find(TypeId::of::<Tag>(), 3), Some(new));

        map.unindex(new, 3);
        assert_eq!(map.find(TypeId::of::<Tag>(), 3), None);
        assert!(map.get(new).is_some());
    }
}
