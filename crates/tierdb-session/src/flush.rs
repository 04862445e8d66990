//! Flush operation ordering, validation and execution.
//!
//! A flush runs in three phases:
//!
//! 1. **Validate** every pending operation before any write: required
//!    columns, unique indexes, referenced parents, and RESTRICT / CASCADE
//!    children of deleted rows. Any failure aborts the whole flush.
//! 2. **Execute** against storage in dependency order:
//!    - DELETE child-first
//!    - INSERT parent-first
//!    - UPDATE any order
//! 3. **Propagate** the written rows into the cache tiers, drop affected
//!    cached query lists and publish dirty events.
//!
//! The same pipeline replays operations taken from the deferred queues, so
//! nothing here depends on a session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use tierdb_cache::{ChangeKind, Engine, EntityMeta, RowChange};
use tierdb_core::{
    Condition, Connection, Error, ForeignKeyError, ForeignKeyErrorKind, QueryError,
    QueryErrorKind, ReferentialAction, RemoteCache, Statement, UniqueKeyError, Value,
    try_outcome, try_result,
};

use crate::identity_map::ObjectKey;

/// A pending write of one row.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub meta: Arc<EntityMeta>,
    pub kind: ChangeKind,
    /// Primary key; zero for an insert that lets storage assign it.
    pub id: u64,
    /// Values before the write; absent for inserts.
    pub prior: Option<Vec<Value>>,
    /// Values to write; absent for deletes.
    pub current: Option<Vec<Value>>,
    /// Session slot the operation came from.
    pub key: Option<ObjectKey>,
    /// Added by a CASCADE reference rather than requested.
    pub cascaded: bool,
}

impl PendingOp {
    pub fn insert(meta: Arc<EntityMeta>, id: u64, current: Vec<Value>) -> Self {
        Self {
            meta,
            kind: ChangeKind::Insert,
            id,
            prior: None,
            current: Some(current),
            key: None,
            cascaded: false,
        }
    }

    pub fn update(meta: Arc<EntityMeta>, id: u64, prior: Vec<Value>, current: Vec<Value>) -> Self {
        Self {
            meta,
            kind: ChangeKind::Update,
            id,
            prior: Some(prior),
            current: Some(current),
            key: None,
            cascaded: false,
        }
    }

    pub fn delete(meta: Arc<EntityMeta>, id: u64, prior: Vec<Value>) -> Self {
        Self {
            meta,
            kind: ChangeKind::Delete,
            id,
            prior: Some(prior),
            current: None,
            key: None,
            cascaded: false,
        }
    }

    /// Attach the originating session slot.
    pub fn with_key(mut self, key: ObjectKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn entity(&self) -> &'static str {
        self.meta.name
    }

    pub fn table(&self) -> &'static str {
        self.meta.schema.table
    }

    pub fn is_insert(&self) -> bool {
        self.kind == ChangeKind::Insert
    }

    pub fn is_update(&self) -> bool {
        self.kind == ChangeKind::Update
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }

    /// Did `column` change? Always true without prior values.
    pub fn column_changed(&self, column: &str) -> bool {
        self.row_change().column_changed(&self.meta, column)
    }

    /// Columns an update has to write.
    pub fn changed_columns(&self) -> Vec<&'static str> {
        self.meta
            .columns()
            .iter()
            .copied()
            .filter(|column| self.column_changed(column))
            .collect()
    }

    pub fn row_change(&self) -> RowChange {
        RowChange {
            kind: self.kind,
            id: self.id,
            prior: self.prior.clone(),
            current: self.current.clone(),
        }
    }
}

/// Options for one flush call.
#[derive(Debug, Clone, Default)]
pub struct FlushOptions {
    /// Flush only these slots instead of every dirty one.
    pub subset: Option<Vec<ObjectKey>>,
    /// Turn an insert that collides on a unique index into an update of
    /// the existing row; the entity adopts that row's id.
    pub on_duplicate_update: bool,
}

impl FlushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only(mut self, keys: impl IntoIterator<Item = ObjectKey>) -> Self {
        self.subset = Some(keys.into_iter().collect());
        self
    }

    pub fn on_duplicate_update(mut self, enabled: bool) -> Self {
        self.on_duplicate_update = enabled;
        self
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Physical deletes, cascaded ones included.
    pub deleted: usize,
    /// Deletes added by CASCADE references.
    pub cascaded: usize,
}

impl FlushSummary {
    pub fn of(ops: &[PendingOp]) -> Self {
        let mut summary = Self::default();
        for op in ops {
            match op.kind {
                ChangeKind::Insert => summary.inserted += 1,
                ChangeKind::Update => summary.updated += 1,
                ChangeKind::Delete => {
                    summary.deleted += 1;
                    if op.cascaded {
                        summary.cascaded += 1;
                    }
                }
            }
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.inserted + self.updated + self.deleted == 0
    }
}

/// Orders operations by reference dependencies.
///
/// Entities referencing others (children) are deleted first and inserted
/// last.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity -> entities it references.
    dependencies: HashMap<&'static str, Vec<&'static str>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity's reference columns.
    pub fn register(&mut self, meta: &EntityMeta) {
        let deps: Vec<&'static str> = meta
            .schema
            .references()
            .filter_map(|c| c.references)
            .filter(|target| *target != meta.name)
            .collect();
        self.dependencies.insert(meta.name, deps);
    }

    /// Register an entity's dependencies directly.
    pub fn register_entity(&mut self, entity: &'static str, depends_on: Vec<&'static str>) {
        self.dependencies.insert(entity, depends_on);
    }

    fn dependency_count(&self, entity: &str) -> usize {
        self.dependencies.get(entity).map_or(0, Vec::len)
    }

    /// Order operations into a flush plan.
    ///
    /// - Deletes: child-first (more dependencies = delete first)
    /// - Inserts: parent-first (fewer dependencies = insert first)
    /// - Updates: any order
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for op in ops {
            match op.kind {
                ChangeKind::Delete => deletes.push(op),
                ChangeKind::Insert => inserts.push(op),
                ChangeKind::Update => updates.push(op),
            }
        }

        deletes.sort_by(|a, b| {
            let a_deps = self.dependency_count(a.entity());
            let b_deps = self.dependency_count(b.entity());
            b_deps.cmp(&a_deps)
        });

        inserts.sort_by(|a, b| {
            let a_deps = self.dependency_count(a.entity());
            let b_deps = self.dependency_count(b.entity());
            a_deps.cmp(&b_deps)
        });

        FlushPlan {
            deletes,
            inserts,
            updates,
        }
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (any order).
    pub updates: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    fn into_ops(self) -> impl Iterator<Item = PendingOp> {
        self.deletes
            .into_iter()
            .chain(self.inserts)
            .chain(self.updates)
    }
}

/// Runs the validate / execute / propagate pipeline over an engine.
pub struct Flusher<'a, S, R> {
    engine: &'a Engine<S, R>,
    on_duplicate_update: bool,
}

impl<'a, S: Connection, R: RemoteCache> Flusher<'a, S, R> {
    pub fn new(engine: &'a Engine<S, R>) -> Self {
        Self {
            engine,
            on_duplicate_update: false,
        }
    }

    pub fn on_duplicate_update(mut self, enabled: bool) -> Self {
        self.on_duplicate_update = enabled;
        self
    }

    /// Validate, write to storage and propagate to the cache tiers.
    ///
    /// Returns the operations as written: storage-assigned ids filled in,
    /// converted duplicates and cascaded deletes included.
    #[tracing::instrument(level = "debug", skip_all, fields(ops = ops.len()))]
    pub async fn flush(&self, cx: &Cx, ops: Vec<PendingOp>) -> Outcome<Vec<PendingOp>, Error> {
        let ops = try_outcome!(self.validate(cx, ops).await);
        let plan = self.plan(ops);
        tracing::info!(
            target: "tierdb::flush",
            deletes = plan.deletes.len(),
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();
        let applied = try_outcome!(self.execute(cx, plan).await);
        try_outcome!(self.propagate(cx, &applied, true).await);

        let summary = FlushSummary::of(&applied);
        tracing::info!(
            target: "tierdb::flush",
            elapsed_ms = start.elapsed().as_millis(),
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            cascaded = summary.cascaded,
            "Flush complete"
        );
        Outcome::Ok(applied)
    }

    /// Validate and write to the cache tiers only, leaving storage behind.
    pub async fn flush_to_cache(
        &self,
        cx: &Cx,
        ops: Vec<PendingOp>,
    ) -> Outcome<Vec<PendingOp>, Error> {
        let ops = try_outcome!(self.validate(cx, ops).await);
        let ops: Vec<PendingOp> = self.plan(ops).into_ops().collect();
        try_outcome!(self.propagate(cx, &ops, false).await);
        Outcome::Ok(ops)
    }

    fn plan(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut orderer = FlushOrderer::new();
        for op in &ops {
            if !orderer.dependencies.contains_key(op.entity()) {
                orderer.register(&op.meta);
            }
        }
        orderer.order(ops)
    }

    /// Every check that has to pass before the first write.
    pub async fn validate(&self, cx: &Cx, mut ops: Vec<PendingOp>) -> Outcome<Vec<PendingOp>, Error> {
        for op in &ops {
            try_result!(check_required(op));
        }
        try_outcome!(self.expand_deletes(cx, &mut ops).await);
        try_outcome!(self.check_unique(cx, &mut ops).await);
        try_outcome!(self.check_references(cx, &ops).await);
        Outcome::Ok(ops)
    }

    /// Apply RESTRICT and CASCADE rules to every physical delete.
    async fn expand_deletes(&self, cx: &Cx, ops: &mut Vec<PendingOp>) -> Outcome<(), Error> {
        let mut scheduled: HashSet<(&'static str, u64)> = ops
            .iter()
            .filter(|op| op.is_delete())
            .map(|op| (op.entity(), op.id))
            .collect();
        let mut queue: VecDeque<(Arc<EntityMeta>, u64)> = ops
            .iter()
            .filter(|op| op.is_delete() && !op.meta.children.is_empty())
            .map(|op| (Arc::clone(&op.meta), op.id))
            .collect();

        while let Some((meta, id)) = queue.pop_front() {
            for child in &meta.children {
                let child_meta = try_result!(self.engine.meta_by_name(child.entity));
                let stmt = Statement::Select {
                    table: child_meta.schema.table,
                    columns: Vec::new(),
                    filter: vec![Condition::eq(child.column, id)],
                    order: Vec::new(),
                    limit: None,
                };
                let rows = try_outcome!(self.engine.query(cx, &child_meta, &stmt).await);
                for row in rows {
                    let Some(child_id) = row
                        .get_by_name(child_meta.schema.primary_key)
                        .and_then(Value::as_id)
                    else {
                        continue;
                    };
                    if scheduled.contains(&(child_meta.name, child_id)) {
                        continue;
                    }
                    match child.action {
                        ReferentialAction::Restrict => {
                            tracing::debug!(
                                target: "tierdb::flush",
                                parent = meta.name,
                                id,
                                child = child.entity,
                                child_id,
                                "Delete restricted by child"
                            );
                            return Outcome::Err(Error::ForeignKeyViolation(ForeignKeyError {
                                kind: ForeignKeyErrorKind::RestrictedChildren,
                                entity: child.entity.to_string(),
                                column: child.column.to_string(),
                                referenced: meta.name.to_string(),
                                id,
                            }));
                        }
                        ReferentialAction::Cascade => {
                            scheduled.insert((child_meta.name, child_id));
                            let values = child_meta.values_from_row(&row);
                            let mut op = PendingOp::delete(Arc::clone(&child_meta), child_id, values);
                            op.cascaded = true;
                            ops.push(op);
                            queue.push_back((Arc::clone(&child_meta), child_id));
                        }
                    }
                }
            }
        }

        // A row deleted by cascade does not also need its pending update.
        ops.retain(|op| !(op.is_update() && scheduled.contains(&(op.entity(), op.id))));
        Outcome::Ok(())
    }

    async fn check_unique(&self, cx: &Cx, ops: &mut [PendingOp]) -> Outcome<(), Error> {
        let deleting: HashSet<(&'static str, u64)> = ops
            .iter()
            .filter(|op| op.is_delete())
            .map(|op| (op.entity(), op.id))
            .collect();
        let mut claimed: HashSet<String> = HashSet::new();

        for op in ops.iter_mut() {
            if op.is_delete() || op.meta.schema.unique.is_empty() {
                continue;
            }
            let meta = Arc::clone(&op.meta);
            for index in &meta.schema.unique {
                if op.is_update() && !index.columns.iter().any(|c| op.column_changed(c)) {
                    continue;
                }
                let current = op.current.as_deref().unwrap_or_default();
                let values: Vec<Value> = index
                    .columns
                    .iter()
                    .map(|c| meta.value_in(op.id, current, c))
                    .collect();
                if values.iter().any(Value::is_null) {
                    continue;
                }

                let claim = format!(
                    "{}\u{0}{}\u{0}{}",
                    meta.name,
                    index.name,
                    serde_json::to_string(&values.iter().map(Value::normalized).collect::<Vec<_>>())
                        .unwrap_or_default()
                );
                if !claimed.insert(claim) {
                    return Outcome::Err(Error::DuplicateUniqueKey(UniqueKeyError {
                        entity: meta.name.to_string(),
                        index: index.name.to_string(),
                        existing_id: None,
                    }));
                }

                let pk = meta.schema.primary_key;
                let stmt = Statement::Select {
                    table: meta.schema.table,
                    columns: vec![pk],
                    filter: index
                        .columns
                        .iter()
                        .zip(&values)
                        .map(|(c, v)| Condition::eq(*c, v.clone()))
                        .collect(),
                    order: Vec::new(),
                    limit: Some(2),
                };
                let rows = try_outcome!(self.engine.query(cx, &meta, &stmt).await);
                let existing = rows
                    .iter()
                    .filter_map(|row| row.get_by_name(pk).and_then(Value::as_id))
                    .find(|id| *id != op.id && !deleting.contains(&(meta.name, *id)));
                let Some(existing) = existing else {
                    continue;
                };

                if self.on_duplicate_update && op.is_insert() {
                    let mut loaded =
                        try_outcome!(self.engine.load_from_storage(cx, &meta, &[existing]).await);
                    tracing::debug!(
                        target: "tierdb::flush",
                        entity = meta.name,
                        index = index.name,
                        existing,
                        "Duplicate insert converted to update"
                    );
                    op.kind = ChangeKind::Update;
                    op.id = existing;
                    op.prior = loaded.remove(&existing);
                    break;
                }
                return Outcome::Err(Error::DuplicateUniqueKey(UniqueKeyError {
                    entity: meta.name.to_string(),
                    index: index.name.to_string(),
                    existing_id: Some(existing),
                }));
            }
        }
        Outcome::Ok(())
    }

    async fn check_references(&self, cx: &Cx, ops: &[PendingOp]) -> Outcome<(), Error> {
        let inserted: HashSet<(&'static str, u64)> = ops
            .iter()
            .filter(|op| op.is_insert() && op.id != 0)
            .map(|op| (op.entity(), op.id))
            .collect();
        let deleted: HashSet<(&'static str, u64)> = ops
            .iter()
            .filter(|op| op.is_delete())
            .map(|op| (op.entity(), op.id))
            .collect();

        // target entity -> (parent id, op index, column)
        let mut wanted: HashMap<&'static str, Vec<(u64, usize, &'static str)>> = HashMap::new();
        for (idx, op) in ops.iter().enumerate() {
            let Some(current) = op.current.as_deref() else {
                continue;
            };
            for column in op.meta.schema.references() {
                let Some(target) = column.references else {
                    continue;
                };
                if op.is_update() && !op.column_changed(column.name) {
                    continue;
                }
                let Some(parent) = op.meta.value_in(op.id, current, column.name).as_id() else {
                    continue;
                };
                if deleted.contains(&(target, parent)) {
                    return Outcome::Err(missing_parent(op, column.name, target));
                }
                if inserted.contains(&(target, parent)) {
                    continue;
                }
                wanted.entry(target).or_default().push((parent, idx, column.name));
            }
        }

        for (target, refs) in wanted {
            let meta = try_result!(self.engine.meta_by_name(target));
            let ids: Vec<u64> = refs.iter().map(|(parent, _, _)| *parent).collect();
            let found = try_outcome!(self.engine.get_rows(cx, &meta, &ids).await);
            if let Some((_, idx, column)) = refs.iter().find(|(parent, _, _)| !found.contains_key(parent)) {
                return Outcome::Err(missing_parent(&ops[*idx], column, target));
            }
        }
        Outcome::Ok(())
    }

    /// Write the plan to storage.
    ///
    /// Rows already written when a later statement fails are dropped from
    /// the cache tiers, since storage is not rolled back.
    pub async fn execute(&self, cx: &Cx, plan: FlushPlan) -> Outcome<Vec<PendingOp>, Error> {
        let mut applied = Vec::with_capacity(plan.len());
        for mut op in plan.into_ops() {
            match self.execute_one(cx, &mut op).await {
                Outcome::Ok(()) => applied.push(op),
                failed => {
                    if !applied.is_empty() {
                        tracing::warn!(
                            target: "tierdb::flush",
                            written = applied.len(),
                            entity = op.entity(),
                            id = op.id,
                            "Flush failed after partial writes"
                        );
                        if let Outcome::Err(e) = self.forget(cx, &applied).await {
                            tracing::warn!(
                                target: "tierdb::flush",
                                written = applied.len(),
                                error = %e,
                                "Could not drop cached rows after partial writes"
                            );
                        }
                    }
                    return match failed {
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(r) => Outcome::Cancelled(r),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                        Outcome::Ok(()) => Outcome::Ok(applied),
                    };
                }
            }
        }
        Outcome::Ok(applied)
    }

    async fn execute_one(&self, cx: &Cx, op: &mut PendingOp) -> Outcome<(), Error> {
        let meta = Arc::clone(&op.meta);
        let pk = meta.schema.primary_key;
        match op.kind {
            ChangeKind::Insert => {
                let current = op.current.as_deref().unwrap_or_default();
                let mut columns = Vec::with_capacity(current.len() + 1);
                let mut values = Vec::with_capacity(current.len() + 1);
                if op.id != 0 {
                    columns.push(pk);
                    values.push(Value::from(op.id));
                }
                columns.extend_from_slice(meta.columns());
                values.extend(current.iter().cloned());
                let stmt = Statement::Insert {
                    table: meta.schema.table,
                    columns,
                    values,
                };
                let result = try_outcome!(self.engine.execute(cx, &meta, op.id, &stmt).await);
                if op.id == 0 {
                    match result.last_insert_id {
                        Some(id) => op.id = id,
                        None => {
                            return Outcome::Err(Error::Query(QueryError {
                                kind: QueryErrorKind::Database,
                                sql: Some(stmt.to_sql()),
                                sqlstate: None,
                                message: format!("insert into {} returned no id", meta.schema.table),
                                detail: None,
                                source: None,
                            }));
                        }
                    }
                }
            }
            ChangeKind::Update => {
                let current = op.current.as_deref().unwrap_or_default();
                let set: Vec<(&'static str, Value)> = op
                    .changed_columns()
                    .into_iter()
                    .filter_map(|column| {
                        meta.position(column)
                            .and_then(|pos| current.get(pos))
                            .map(|v| (column, v.clone()))
                    })
                    .collect();
                if set.is_empty() {
                    return Outcome::Ok(());
                }
                let stmt = Statement::Update {
                    table: meta.schema.table,
                    set,
                    filter: vec![Condition::eq(pk, op.id)],
                };
                let result = try_outcome!(self.engine.execute(cx, &meta, op.id, &stmt).await);
                if result.rows_affected == 0 {
                    return Outcome::Err(Error::EntityNotFound {
                        entity: meta.name.to_string(),
                        id: op.id,
                    });
                }
            }
            ChangeKind::Delete => {
                let stmt = Statement::Delete {
                    table: meta.schema.table,
                    filter: vec![Condition::eq(pk, op.id)],
                };
                try_outcome!(self.engine.execute(cx, &meta, op.id, &stmt).await);
            }
        }
        Outcome::Ok(())
    }

    /// Push written rows into the cache tiers and drop stale lists.
    pub async fn propagate(&self, cx: &Cx, ops: &[PendingOp], publish: bool) -> Outcome<(), Error> {
        let mut groups: Vec<(Arc<EntityMeta>, Vec<&PendingOp>)> = Vec::new();
        for op in ops {
            match groups.iter_mut().find(|(meta, _)| meta.name == op.entity()) {
                Some((_, group)) => group.push(op),
                None => groups.push((Arc::clone(&op.meta), vec![op])),
            }
        }

        for (meta, group) in &groups {
            let rows: Vec<(u64, Vec<Value>)> = group
                .iter()
                .filter_map(|op| op.current.as_ref().map(|values| (op.id, values.clone())))
                .collect();
            try_outcome!(self.engine.set_rows(cx, meta, &rows).await);

            let deleted: Vec<u64> = group
                .iter()
                .filter(|op| op.is_delete())
                .map(|op| op.id)
                .collect();
            try_outcome!(self.engine.invalidate_rows(cx, meta, &deleted).await);

            let changes: Vec<RowChange> = group.iter().map(|op| op.row_change()).collect();
            try_outcome!(self.engine.invalidate_indexes(cx, meta, &changes).await);
        }

        if publish {
            let changes: Vec<(Arc<EntityMeta>, RowChange)> = ops
                .iter()
                .map(|op| (Arc::clone(&op.meta), op.row_change()))
                .collect();
            try_outcome!(self.engine.publish_dirty(cx, &changes).await);
        }
        Outcome::Ok(())
    }

    /// Drop cached rows and lists touched by `ops` without writing new ones.
    pub async fn forget(&self, cx: &Cx, ops: &[PendingOp]) -> Outcome<(), Error> {
        for op in ops {
            try_outcome!(self.engine.invalidate_rows(cx, &op.meta, &[op.id]).await);
            try_outcome!(
                self.engine
                    .invalidate_indexes(cx, &op.meta, &[op.row_change()])
                    .await
            );
        }
        Outcome::Ok(())
    }
}

/// Reject writes leaving a required column null, empty or without a parent id.
#[allow(clippy::result_large_err)]
pub fn check_required(op: &PendingOp) -> Result<(), Error> {
    let Some(current) = op.current.as_deref() else {
        return Ok(());
    };
    for (column, value) in op.meta.schema.columns.iter().zip(current) {
        if !column.required {
            continue;
        }
        let missing = match value {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            other => column.references.is_some() && other.as_id().is_none(),
        };
        if missing {
            return Err(Error::RequiredFieldMissing {
                entity: op.entity().to_string(),
                column: column.name.to_string(),
            });
        }
    }
    Ok(())
}

fn missing_parent(op: &PendingOp, column: &str, target: &str) -> Error {
    Error::ForeignKeyViolation(ForeignKeyError {
        kind: ForeignKeyErrorKind::MissingParent,
        entity: op.entity().to_string(),
        column: column.to_string(),
        referenced: target.to_string(),
        id: op.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierdb_cache::Hooks;
    use tierdb_core::{Column, Entity, EntitySchema, Result, Row, SqlType};

    struct Owner {
        id: u64,
    }

    struct Pet {
        id: u64,
        owner: u64,
    }

    impl Entity for Owner {
        const ENTITY_NAME: &'static str = "Owner";

        fn schema() -> EntitySchema {
            EntitySchema::new("owners").column(Column::new("name", SqlType::Text).required())
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            Vec::new()
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }
    }

    impl Entity for Pet {
        const ENTITY_NAME: &'static str = "Pet";

        fn schema() -> EntitySchema {
            EntitySchema::new("pets").column(Column::reference("owner_id", "Owner"))
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("owner_id", Value::from(self.owner))]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
                owner: row.get_named("owner_id")?,
            })
        }
    }

    fn owner_meta() -> Arc<EntityMeta> {
        Arc::new(EntityMeta::for_type::<Owner>(Hooks::default()))
    }

    fn pet_meta() -> Arc<EntityMeta> {
        Arc::new(EntityMeta::for_type::<Pet>(Hooks::default()))
    }

    #[test]
    fn orderer_deletes_children_first_and_inserts_parents_first() {
        let mut orderer = FlushOrderer::new();
        orderer.register(&owner_meta());
        orderer.register(&pet_meta());

        let plan = orderer.order(vec![
            PendingOp::insert(pet_meta(), 0, vec![Value::from(1_u64)]),
            PendingOp::delete(owner_meta(), 1, vec![Value::from("a")]),
            PendingOp::insert(owner_meta(), 0, vec![Value::from("b")]),
            PendingOp::delete(pet_meta(), 2, vec![Value::from(1_u64)]),
        ]);
        let inserts: Vec<&str> = plan.inserts.iter().map(PendingOp::entity).collect();
        let deletes: Vec<&str> = plan.deletes.iter().map(PendingOp::entity).collect();
        assert_eq!(inserts, vec!["Owner", "Pet"]);
        assert_eq!(deletes, vec!["Pet", "Owner"]);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn required_text_must_be_non_empty() {
        let op = PendingOp::insert(owner_meta(), 0, vec![Value::from("")]);
        assert!(matches!(
            check_required(&op),
            Err(Error::RequiredFieldMissing { .. })
        ));
        let op = PendingOp::insert(owner_meta(), 0, vec![Value::from("x")]);
        assert!(check_required(&op).is_ok());
        let op = PendingOp::delete(owner_meta(), 3, vec![Value::Null]);
        assert!(check_required(&op).is_ok());
    }

    #[test]
    fn update_writes_only_changed_columns() {
        let op = PendingOp::update(pet_meta(), 4, vec![Value::from(1_u64)], vec![Value::Int(1)]);
        assert!(op.changed_columns().is_empty());
        let op = PendingOp::update(pet_meta(), 4, vec![Value::from(1_u64)], vec![Value::from(2_u64)]);
        assert_eq!(op.changed_columns(), vec!["owner_id"]);
    }

    #[test]
    fn summary_counts_cascades() {
        let mut cascaded = PendingOp::delete(pet_meta(), 2, vec![Value::from(1_u64)]);
        cascaded.cascaded = true;
        let summary = FlushSummary::of(&[
            PendingOp::insert(owner_meta(), 0, vec![Value::from("b")]),
            PendingOp::delete(owner_meta(), 1, vec![Value::from("a")]),
            cascaded,
        ]);
        assert_eq!(
            summary,
            FlushSummary {
                inserted: 1,
                updated: 0,
                deleted: 2,
                cascaded: 1,
            }
        );
    }
}
