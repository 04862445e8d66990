//! Session and Unit of Work for tierdb.
//!
//! `tierdb-session` is the **unit-of-work layer**. It coordinates object
//! identity, change tracking and flushing on top of the cache engine.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single tracked instance per `(type, id)`.
//! - **Change tracking**: snapshots taken at load and flush time decide what
//!   a flush writes.
//! - **Flush**: validate everything, then write storage and propagate into
//!   the cache tiers and cached query lists.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing is written until `flush`.
//! - **Plain records**: entities carry no tracking state; the session owns
//!   identity, snapshots and the fake-delete flag, addressed by [`Handle`]s.
//! - **Type erasure**: the identity map stores `Box<dyn Any>` for
//!   heterogeneous entity types.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`; a flush
//!   that fails or is cancelled leaves tracked state untouched.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(&engine);
//!
//! // New entities are inserted on flush
//! let hero = session.track(Hero::new("Ann", 10))?;
//!
//! // Loads go local cache, remote cache, then storage
//! let other = session.must_load_by_id::<Hero>(&cx, 7).await?;
//! session.get_mut(other).unwrap().age = 18;
//!
//! // Cached query lists, sliced into pages
//! let page = session.cached_search::<Hero>(&cx, "IndexAge", &[18.into()], Pager::new(1, 20)).await?;
//!
//! session.flush(&cx).await?;
//! ```

pub mod change_tracker;
pub mod flush;
pub mod identity_map;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use flush::{
    FlushOptions, FlushOrderer, FlushPlan, FlushSummary, Flusher, PendingOp, check_required,
};
pub use identity_map::{Handle, IdentityMap, ObjectKey, ObjectState, TrackedObject};

use std::any::Any;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use tierdb_cache::{ChangeKind, Engine, EntityMeta, Hook, Pager};
use tierdb_core::{
    Connection, Entity, Error, RemoteCache, Result, SchemaError, SchemaErrorKind, Value,
    try_outcome, try_result,
};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` from a before-callback aborts the flush.
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Session-level callbacks fired around every flush.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(callbacks: &mut [SessionEventFn]) -> Result<()> {
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// A page of a cached query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage<E> {
    pub handles: Vec<Handle<E>>,
    /// Size of the whole list, not just this page.
    pub total: usize,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It tracks entities loaded through it or handed to [`Session::track`]
/// and coordinates flushing their changes. A session belongs to one task;
/// run one session per task for concurrency.
pub struct Session<S, R> {
    engine: Engine<S, R>,
    map: IdentityMap,
    tracker: ChangeTracker,
    event_callbacks: SessionEventCallbacks,
}

impl<S, R> std::fmt::Debug for Session<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracked", &self.map.slot_count())
            .field("snapshots", &self.tracker.len())
            .field("events", &self.event_callbacks)
            .finish()
    }
}

impl<S: Connection, R: RemoteCache> Session<S, R> {
    /// Create a session on a shared engine.
    pub fn new(engine: &Engine<S, R>) -> Self {
        Self {
            engine: engine.clone(),
            map: IdentityMap::new(),
            tracker: ChangeTracker::new(),
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    pub fn engine(&self) -> &Engine<S, R> {
        &self.engine
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before every flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after every successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track a newly constructed entity; it is inserted by the next flush.
    ///
    /// Tracking an identity that is already tracked returns the existing
    /// handle unchanged and drops `entity`.
    #[allow(clippy::result_large_err)]
    pub fn track<E: Entity>(&mut self, entity: E) -> Result<Handle<E>> {
        let meta = self.engine.meta::<E>()?;
        let (key, created) = self
            .map
            .insert(TrackedObject::new(meta, Box::new(entity), ObjectState::New));
        if created {
            tracing::debug!(entity = E::ENTITY_NAME, slot = key.slot(), "Tracking new entity");
        }
        Ok(Handle::new(key))
    }

    pub fn get<E: Entity>(&self, handle: Handle<E>) -> Option<&E> {
        self.map.entity(handle)
    }

    pub fn get_mut<E: Entity>(&mut self, handle: Handle<E>) -> Option<&mut E> {
        self.map.entity_mut(handle)
    }

    pub fn state<E: Entity>(&self, handle: Handle<E>) -> Option<ObjectState> {
        self.map.get(handle.key()).map(TrackedObject::state)
    }

    /// Handle of the tracked instance of `(E, id)`, if any.
    pub fn handle_of<E: Entity>(&self, id: u64) -> Option<Handle<E>> {
        self.map
            .find(std::any::TypeId::of::<E>(), id)
            .map(Handle::new)
    }

    /// Would the next flush write this entity?
    pub fn is_dirty<E: Entity>(&self, handle: Handle<E>) -> bool {
        self.is_key_dirty(handle.key())
    }

    pub fn is_fake_deleted<E: Entity>(&self, handle: Handle<E>) -> bool {
        self.map
            .get(handle.key())
            .is_some_and(|t| t.fake_deleted)
    }

    fn is_key_dirty(&self, key: ObjectKey) -> bool {
        let Some(tracked) = self.map.get(key) else {
            return false;
        };
        match tracked.state {
            ObjectState::Deleted | ObjectState::Detached => false,
            ObjectState::New => !tracked.delete_requested,
            ObjectState::Persistent => {
                tracked.delete_requested
                    || self.tracker.is_dirty(&key, &current_values(tracked))
            }
        }
    }

    /// Number of tracked entities the next flush would write.
    pub fn dirty_count(&self) -> usize {
        self.map
            .keys()
            .into_iter()
            .filter(|key| self.is_key_dirty(*key))
            .count()
    }

    /// Number of tracked slots.
    pub fn tracked_count(&self) -> usize {
        self.map.slot_count()
    }

    /// Mark for deletion. Fake-delete types are flagged and written as an
    /// update; others are physically deleted by the next flush.
    ///
    /// Returns false when the handle is not tracked.
    pub fn mark_to_delete<E: Entity>(&mut self, handle: Handle<E>) -> bool {
        let Some(tracked) = self.map.get_mut(handle.key()) else {
            return false;
        };
        if tracked.meta.schema.fake_delete.is_some() {
            tracked.fake_deleted = true;
        } else {
            tracked.delete_requested = true;
        }
        true
    }

    /// Mark for physical deletion regardless of fake-delete support.
    pub fn force_mark_to_delete<E: Entity>(&mut self, handle: Handle<E>) -> bool {
        let Some(tracked) = self.map.get_mut(handle.key()) else {
            return false;
        };
        tracked.delete_requested = true;
        true
    }

    /// Forget every tracked entity and snapshot.
    pub fn clear(&mut self) {
        self.map.clear();
        self.tracker.clear_all();
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load one entity by id. Missing and fake-deleted rows are `None`.
    pub async fn load_by_id<E: Entity>(&mut self, cx: &Cx, id: u64) -> Outcome<Option<Handle<E>>, Error> {
        let loaded = try_outcome!(self.load_by_ids::<E>(cx, &[id]).await);
        Outcome::Ok(loaded.into_iter().next().flatten())
    }

    /// Load one entity by id, failing with [`Error::EntityNotFound`].
    pub async fn must_load_by_id<E: Entity>(&mut self, cx: &Cx, id: u64) -> Outcome<Handle<E>, Error> {
        match try_outcome!(self.load_by_id::<E>(cx, id).await) {
            Some(handle) => Outcome::Ok(handle),
            None => Outcome::Err(Error::EntityNotFound {
                entity: E::ENTITY_NAME.to_string(),
                id,
            }),
        }
    }

    /// Load many entities in one batch; the result is aligned with `ids`.
    pub async fn load_by_ids<E: Entity>(
        &mut self,
        cx: &Cx,
        ids: &[u64],
    ) -> Outcome<Vec<Option<Handle<E>>>, Error> {
        let meta = try_result!(self.engine.meta::<E>());
        let keys = try_outcome!(self.load_keys(cx, &meta, ids).await);
        Outcome::Ok(keys.into_iter().map(|k| k.map(Handle::new)).collect())
    }

    /// Load rows into the identity map. Tracked instances win over cached
    /// rows so unflushed edits stay visible.
    async fn load_keys(
        &mut self,
        cx: &Cx,
        meta: &Arc<EntityMeta>,
        ids: &[u64],
    ) -> Outcome<Vec<Option<ObjectKey>>, Error> {
        let mut keys: Vec<Option<ObjectKey>> = vec![None; ids.len()];
        let mut missing = Vec::new();
        for (pos, id) in ids.iter().enumerate() {
            match self.map.find(meta.type_id, *id) {
                Some(key) => {
                    let live = self
                        .map
                        .get(key)
                        .is_some_and(|t| !t.fake_deleted && t.state != ObjectState::Detached);
                    if live {
                        keys[pos] = Some(key);
                    }
                }
                None => missing.push(*id),
            }
        }
        if missing.is_empty() {
            return Outcome::Ok(keys);
        }

        let rows = try_outcome!(self.engine.get_rows(cx, meta, &missing).await);
        for (pos, id) in ids.iter().enumerate() {
            if keys[pos].is_some() {
                continue;
            }
            if let Some(values) = rows.get(id) {
                keys[pos] = Some(try_result!(self.adopt(meta, *id, values)));
            }
        }
        Outcome::Ok(keys)
    }

    /// Track a row read from the cache tiers or storage.
    #[allow(clippy::result_large_err)]
    fn adopt(&mut self, meta: &Arc<EntityMeta>, id: u64, values: &[Value]) -> Result<ObjectKey> {
        if let Some(key) = self.map.find(meta.type_id, id) {
            return Ok(key);
        }
        let object = meta.instantiate(id, values)?;
        // Snapshot what the record renders back to, so lossy column
        // conversions do not read as edits.
        let snapshot = meta.values_of(object.as_ref(), false);
        let (key, _) = self.map.insert(TrackedObject::new(
            Arc::clone(meta),
            object,
            ObjectState::Persistent,
        ));
        self.tracker.snapshot(key, snapshot);
        Ok(key)
    }

    /// Resolve the entity a reference column points at.
    pub async fn reference<E: Entity, P: Entity>(
        &mut self,
        cx: &Cx,
        handle: Handle<E>,
        column: &str,
    ) -> Outcome<Option<Handle<P>>, Error> {
        let meta = try_result!(self.engine.meta::<E>());
        let target = meta.schema.column_named(column).and_then(|c| c.references);
        if target != Some(P::ENTITY_NAME) {
            return Outcome::Err(not_a_reference(meta.name, column, Some(P::ENTITY_NAME)));
        }
        let Some(parent) = self.reference_id(handle.key(), column) else {
            return Outcome::Ok(None);
        };
        self.load_by_id::<P>(cx, parent).await
    }

    fn reference_id(&self, key: ObjectKey, column: &str) -> Option<u64> {
        let tracked = self.map.get(key)?;
        let values = current_values(tracked);
        tracked
            .meta
            .value_in(tracked.id(), &values, column)
            .as_id()
    }

    /// Batch-load the targets of reference columns for many entities.
    ///
    /// One lookup per column; returns how many referenced entities are now
    /// tracked.
    #[tracing::instrument(level = "debug", skip(self, cx, handles))]
    pub async fn load_references<E: Entity>(
        &mut self,
        cx: &Cx,
        handles: &[Handle<E>],
        columns: &[&str],
    ) -> Outcome<usize, Error> {
        let meta = try_result!(self.engine.meta::<E>());
        let mut loaded = 0;
        for column in columns {
            let Some(target) = meta.schema.column_named(column).and_then(|c| c.references) else {
                return Outcome::Err(not_a_reference(meta.name, column, None));
            };
            let target_meta = try_result!(self.engine.meta_by_name(target));
            let mut ids: Vec<u64> = handles
                .iter()
                .filter_map(|h| self.reference_id(h.key(), column))
                .collect();
            ids.sort_unstable();
            ids.dedup();
            let keys = try_outcome!(self.load_keys(cx, &target_meta, &ids).await);
            loaded += keys.iter().flatten().count();
        }
        tracing::debug!(
            entity = meta.name,
            parents = handles.len(),
            loaded,
            "Loaded references"
        );
        Outcome::Ok(loaded)
    }

    // ========================================================================
    // Cached Queries
    // ========================================================================

    /// Ids of one page of a cached query, plus the full list size.
    pub async fn cached_search_ids<E: Entity>(
        &mut self,
        cx: &Cx,
        index: &str,
        args: &[Value],
        pager: Pager,
    ) -> Outcome<(Vec<u64>, usize), Error> {
        let meta = try_result!(self.engine.meta::<E>());
        let ids = try_outcome!(self.engine.search_ids(cx, &meta, index, args).await);
        Outcome::Ok((pager.slice(&ids).to_vec(), ids.len()))
    }

    /// Size of a cached query's full list.
    pub async fn cached_search_count<E: Entity>(
        &mut self,
        cx: &Cx,
        index: &str,
        args: &[Value],
    ) -> Outcome<usize, Error> {
        let meta = try_result!(self.engine.meta::<E>());
        let ids = try_outcome!(self.engine.search_ids(cx, &meta, index, args).await);
        Outcome::Ok(ids.len())
    }

    /// One page of a cached query, loaded into the session.
    pub async fn cached_search<E: Entity>(
        &mut self,
        cx: &Cx,
        index: &str,
        args: &[Value],
        pager: Pager,
    ) -> Outcome<SearchPage<E>, Error> {
        let (ids, total) = try_outcome!(self.cached_search_ids::<E>(cx, index, args, pager).await);
        let handles = try_outcome!(self.load_by_ids::<E>(cx, &ids).await);
        Outcome::Ok(SearchPage {
            handles: handles.into_iter().flatten().collect(),
            total,
        })
    }

    /// First entity of a cached query.
    pub async fn cached_search_one<E: Entity>(
        &mut self,
        cx: &Cx,
        index: &str,
        args: &[Value],
    ) -> Outcome<Option<Handle<E>>, Error> {
        let (ids, _) = try_outcome!(
            self.cached_search_ids::<E>(cx, index, args, Pager::new(1, 1))
                .await
        );
        match ids.first() {
            Some(id) => self.load_by_id::<E>(cx, *id).await,
            None => Outcome::Ok(None),
        }
    }

    /// A cached query page with the given reference columns resolved.
    pub async fn cached_search_with_references<E: Entity>(
        &mut self,
        cx: &Cx,
        index: &str,
        args: &[Value],
        pager: Pager,
        references: &[&str],
    ) -> Outcome<SearchPage<E>, Error> {
        let page = try_outcome!(self.cached_search::<E>(cx, index, args, pager).await);
        try_outcome!(self.load_references(cx, &page.handles, references).await);
        Outcome::Ok(page)
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Flush every dirty tracked entity.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        self.flush_with(cx, FlushOptions::default()).await
    }

    /// Flush with explicit options.
    ///
    /// Either everything validates and is written, or the call fails and
    /// tracked state is left as it was, so a retry is safe.
    #[tracing::instrument(level = "info", skip(self, cx, options))]
    pub async fn flush_with(&mut self, cx: &Cx, options: FlushOptions) -> Outcome<FlushSummary, Error> {
        try_result!(SessionEventCallbacks::fire(&mut self.event_callbacks.before_flush));

        let ops = try_result!(self.pending_ops(&options));
        if ops.is_empty() {
            tracing::debug!(target: "tierdb::flush", "Nothing to flush");
            return Outcome::Ok(FlushSummary::default());
        }

        let engine = self.engine.clone();
        let applied = try_outcome!(
            Flusher::new(&engine)
                .on_duplicate_update(options.on_duplicate_update)
                .flush(cx, ops)
                .await
        );
        self.mark_flushed(&applied);

        try_result!(SessionEventCallbacks::fire(&mut self.event_callbacks.after_flush));
        Outcome::Ok(FlushSummary::of(&applied))
    }

    /// Collect the writes the next flush would make, running `before_*` hooks.
    ///
    /// Hook errors abort collection. Tracked state other than what the hooks
    /// change is not touched.
    #[allow(clippy::result_large_err)]
    pub fn pending_ops(&mut self, options: &FlushOptions) -> Result<Vec<PendingOp>> {
        let keys = options.subset.clone().unwrap_or_else(|| self.map.keys());
        let mut ops = Vec::new();
        for key in keys {
            if let Some(op) = self.pending_op(key)? {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    #[allow(clippy::result_large_err)]
    fn pending_op(&mut self, key: ObjectKey) -> Result<Option<PendingOp>> {
        let Some(tracked) = self.map.get_mut(key) else {
            return Ok(None);
        };
        let meta = Arc::clone(&tracked.meta);
        let prior = self.tracker.get_snapshot(&key).map(|s| s.values().to_vec());

        match tracked.state {
            ObjectState::Deleted | ObjectState::Detached => Ok(None),
            // Deleting an entity that was never written is a no-op.
            ObjectState::New if tracked.delete_requested => Ok(None),
            ObjectState::New => {
                run_hook(meta.hooks.before_insert, tracked)?;
                let current = current_values(tracked);
                Ok(Some(PendingOp::insert(meta, tracked.id(), current).with_key(key)))
            }
            ObjectState::Persistent if tracked.delete_requested => {
                run_hook(meta.hooks.before_delete, tracked)?;
                let values = prior.unwrap_or_else(|| current_values(tracked));
                Ok(Some(PendingOp::delete(meta, tracked.id(), values).with_key(key)))
            }
            ObjectState::Persistent => {
                let current = current_values(tracked);
                let Some(prior) = prior else {
                    return Ok(None);
                };
                if !self.tracker.is_dirty(&key, &current) {
                    return Ok(None);
                }
                let deleting = tracked.fake_deleted && !meta.is_fake_deleted(&prior);
                let hook = if deleting {
                    meta.hooks.before_delete
                } else {
                    meta.hooks.before_update
                };
                run_hook(hook, tracked)?;
                let current = current_values(tracked);
                Ok(Some(
                    PendingOp::update(meta, tracked.id(), prior, current).with_key(key),
                ))
            }
        }
    }

    /// Apply a successful write to tracked state.
    ///
    /// Written entities become persistent with fresh snapshots and ids;
    /// deleted ones leave the identity map. `after_saved` hooks run last.
    pub fn mark_flushed(&mut self, ops: &[PendingOp]) {
        let mut saved = Vec::new();
        for op in ops {
            let key = op.key.or_else(|| self.map.find(op.meta.type_id, op.id));
            let Some(key) = key else {
                continue;
            };
            match op.kind {
                ChangeKind::Insert | ChangeKind::Update => {
                    let Some(tracked) = self.map.get_mut(key) else {
                        continue;
                    };
                    let old_id = tracked.id();
                    if old_id != op.id {
                        let object: &mut dyn Any = tracked.object.as_mut();
                        op.meta.assign_id(object, op.id);
                    }
                    tracked.state = ObjectState::Persistent;
                    if old_id != op.id {
                        self.map.unindex(key, old_id);
                    }
                    if let Some(detached) = self.map.reindex(key, op.id) {
                        self.tracker.clear(&detached);
                    }
                    if let Some(current) = &op.current {
                        self.tracker.snapshot(key, current.clone());
                    }
                    saved.push(key);
                }
                ChangeKind::Delete => {
                    if let Some(tracked) = self.map.get_mut(key) {
                        tracked.state = ObjectState::Deleted;
                        tracked.delete_requested = false;
                    }
                    self.map.unindex(key, op.id);
                    self.tracker.clear(&key);
                }
            }
        }

        for key in saved {
            let Some(tracked) = self.map.get_mut(key) else {
                continue;
            };
            if let Err(e) = run_hook(tracked.meta.hooks.after_saved, tracked) {
                tracing::warn!(
                    target: "tierdb::flush",
                    entity = tracked.meta.name,
                    id = tracked.id(),
                    error = %e,
                    "after_saved hook failed"
                );
            }
        }
    }

    /// Hand pending writes to a deferred writer.
    ///
    /// Updates are treated as written. New entities become detached since
    /// their id is assigned later by the consumer; deletes leave the map.
    pub fn mark_queued(&mut self, ops: &[PendingOp]) {
        for op in ops {
            let Some(key) = op.key else {
                continue;
            };
            match op.kind {
                ChangeKind::Insert => {
                    if let Some(tracked) = self.map.get_mut(key) {
                        tracked.state = ObjectState::Detached;
                    }
                    if op.id != 0 {
                        self.map.unindex(key, op.id);
                    }
                    self.tracker.clear(&key);
                }
                ChangeKind::Update => {
                    if let Some(current) = &op.current {
                        self.tracker.snapshot(key, current.clone());
                    }
                }
                ChangeKind::Delete => {
                    if let Some(tracked) = self.map.get_mut(key) {
                        tracked.state = ObjectState::Deleted;
                        tracked.delete_requested = false;
                    }
                    self.map.unindex(key, op.id);
                    self.tracker.clear(&key);
                }
            }
        }
    }
}

fn current_values(tracked: &TrackedObject) -> Vec<Value> {
    tracked
        .meta
        .values_of(tracked.object.as_ref(), tracked.fake_deleted)
}

#[allow(clippy::result_large_err)]
fn run_hook(hook: Option<Hook>, tracked: &mut TrackedObject) -> Result<()> {
    match hook {
        Some(hook) => hook(tracked.object.as_mut()),
        None => Ok(()),
    }
}

fn not_a_reference(entity: &str, column: &str, expected: Option<&str>) -> Error {
    let message = match expected {
        Some(target) => format!("{entity}.{column} is not a reference to {target}"),
        None => format!("{entity}.{column} is not a reference column"),
    };
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::ColumnNotFound,
        message,
    })
}
