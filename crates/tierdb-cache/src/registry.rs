//! Entity registration.
//!
//! A [`Registry`] collects connection providers and entity types, validates
//! the whole set once, and produces an immutable [`Engine`]. Per-type
//! metadata, including the optional lifecycle-hook capability, is computed
//! here and never again.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tierdb_core::{
    CachedQuery, ColumnInfo, Connection, Entity, EntityEvents, EntitySchema, Error, PoolError,
    PoolErrorKind, ReferentialAction, RemoteCache, Result, Row, SchemaError, SchemaErrorKind,
    Value,
};
use tierdb_pool::Pool;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::local::LocalCache;

/// Type-erased lifecycle hook.
pub type Hook = fn(&mut dyn Any) -> Result<()>;

/// Lifecycle hooks captured at registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hooks {
    pub before_insert: Option<Hook>,
    pub before_update: Option<Hook>,
    pub before_delete: Option<Hook>,
    pub after_saved: Option<Hook>,
}

impl Hooks {
    fn of<E: EntityEvents>() -> Self {
        Self {
            before_insert: Some(hook_before_insert::<E>),
            before_update: Some(hook_before_update::<E>),
            before_delete: Some(hook_before_delete::<E>),
            after_saved: Some(hook_after_saved::<E>),
        }
    }

    /// Were hooks registered for this type?
    pub fn is_empty(&self) -> bool {
        self.before_insert.is_none()
            && self.before_update.is_none()
            && self.before_delete.is_none()
            && self.after_saved.is_none()
    }
}

fn hook_before_insert<E: EntityEvents>(obj: &mut dyn Any) -> Result<()> {
    obj.downcast_mut::<E>().map_or(Ok(()), E::before_insert)
}

fn hook_before_update<E: EntityEvents>(obj: &mut dyn Any) -> Result<()> {
    obj.downcast_mut::<E>().map_or(Ok(()), E::before_update)
}

fn hook_before_delete<E: EntityEvents>(obj: &mut dyn Any) -> Result<()> {
    obj.downcast_mut::<E>().map_or(Ok(()), E::before_delete)
}

fn hook_after_saved<E: EntityEvents>(obj: &mut dyn Any) -> Result<()> {
    obj.downcast_mut::<E>().map_or(Ok(()), E::after_saved)
}

#[derive(Clone, Copy)]
struct ErasedOps {
    to_row: fn(&dyn Any) -> Vec<(&'static str, Value)>,
    from_row: fn(&Row) -> Result<Box<dyn Any + Send + Sync>>,
    id: fn(&dyn Any) -> u64,
    set_id: fn(&mut dyn Any, u64),
}

impl ErasedOps {
    fn of<E: Entity>() -> Self {
        Self {
            to_row: |obj| obj.downcast_ref::<E>().map(E::to_row).unwrap_or_default(),
            from_row: |row| E::from_row(row).map(|e| Box::new(e) as Box<dyn Any + Send + Sync>),
            id: |obj| obj.downcast_ref::<E>().map_or(0, E::id),
            set_id: |obj, id| {
                if let Some(e) = obj.downcast_mut::<E>() {
                    e.set_id(id);
                }
            },
        }
    }
}

/// A reference from another entity type to this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub entity: &'static str,
    pub column: &'static str,
    pub action: ReferentialAction,
}

/// Everything the engine knows about one registered entity type.
pub struct EntityMeta {
    pub name: &'static str,
    pub type_id: TypeId,
    pub schema: EntitySchema,
    pub fingerprint: String,
    /// References pointing at this type from other types.
    pub children: Vec<ChildRef>,
    pub hooks: Hooks,
    ops: ErasedOps,
    columns: Vec<&'static str>,
    row_columns: Arc<ColumnInfo>,
    fake_delete_pos: Option<usize>,
}

impl std::fmt::Debug for EntityMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMeta")
            .field("name", &self.name)
            .field("table", &self.schema.table)
            .field("fingerprint", &self.fingerprint)
            .field("children", &self.children)
            .field("has_hooks", &!self.hooks.is_empty())
            .finish()
    }
}

impl EntityMeta {
    /// Metadata of `E` on its own. References to it stay unresolved until
    /// a registry builds the engine.
    pub fn for_type<E: Entity>(hooks: Hooks) -> Self {
        let schema = E::schema();
        let columns: Vec<&'static str> = schema.columns.iter().map(|c| c.name).collect();
        let mut row_names = vec![schema.primary_key.to_string()];
        row_names.extend(columns.iter().map(|c| (*c).to_string()));
        let fake_delete_pos = schema
            .fake_delete
            .and_then(|flag| columns.iter().position(|c| *c == flag));
        Self {
            name: E::ENTITY_NAME,
            type_id: TypeId::of::<E>(),
            fingerprint: schema.fingerprint(),
            schema,
            children: Vec::new(),
            hooks,
            ops: ErasedOps::of::<E>(),
            columns,
            row_columns: Arc::new(ColumnInfo::new(row_names)),
            fake_delete_pos,
        }
    }

    /// Non-key column names in storage order.
    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    /// Position of a non-key column in value vectors.
    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }

    /// Value of `column` in a value vector; the primary key reads as `id`.
    pub fn value_in(&self, id: u64, values: &[Value], column: &str) -> Value {
        if column == self.schema.primary_key {
            return Value::from(id);
        }
        self.position(column)
            .and_then(|pos| values.get(pos))
            .cloned()
            .unwrap_or_default()
    }

    /// Column values of a live entity; the fake-delete column comes from `fake_deleted`.
    pub fn values_of(&self, obj: &dyn Any, fake_deleted: bool) -> Vec<Value> {
        let pairs = (self.ops.to_row)(obj);
        self.columns
            .iter()
            .enumerate()
            .map(|(pos, column)| {
                if Some(pos) == self.fake_delete_pos {
                    return Value::Bool(fake_deleted);
                }
                pairs
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Column values of a storage row, in schema order.
    pub fn values_from_row(&self, row: &Row) -> Vec<Value> {
        self.columns
            .iter()
            .map(|column| row.get_by_name(column).cloned().unwrap_or_default())
            .collect()
    }

    /// Is the logical-deletion flag set in these values?
    pub fn is_fake_deleted(&self, values: &[Value]) -> bool {
        self.fake_delete_pos
            .and_then(|pos| values.get(pos))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Rebuild a full row (key first) from cached values.
    pub fn build_row(&self, id: u64, values: &[Value]) -> Row {
        let mut all = Vec::with_capacity(values.len() + 1);
        all.push(Value::from(id));
        all.extend(values.iter().cloned());
        Row::with_columns(Arc::clone(&self.row_columns), all)
    }

    /// Build a boxed entity from cached values.
    #[allow(clippy::result_large_err)]
    pub fn instantiate(&self, id: u64, values: &[Value]) -> Result<Box<dyn Any + Send + Sync>> {
        (self.ops.from_row)(&self.build_row(id, values))
    }

    pub fn id_of(&self, obj: &dyn Any) -> u64 {
        (self.ops.id)(obj)
    }

    pub fn assign_id(&self, obj: &mut dyn Any, id: u64) {
        (self.ops.set_id)(obj, id);
    }

    /// Look up a cached query by name.
    #[allow(clippy::result_large_err)]
    pub fn cached_query(&self, name: &str) -> Result<&CachedQuery> {
        self.schema
            .cached_queries
            .iter()
            .find(|q| q.name == name)
            .ok_or_else(|| {
                Error::Schema(SchemaError {
                    kind: SchemaErrorKind::Invalid,
                    message: format!("{} has no cached query '{}'", self.name, name),
                })
            })
    }
}

/// Collects pools and entity types before building an [`Engine`].
pub struct Registry<S, R> {
    storage: HashMap<String, Pool<S>>,
    local: Vec<(String, Option<usize>)>,
    remote: HashMap<String, Pool<R>>,
    entities: Vec<EntityMeta>,
}

impl<S, R> Default for Registry<S, R> {
    fn default() -> Self {
        Self {
            storage: HashMap::new(),
            local: Vec::new(),
            remote: HashMap::new(),
            entities: Vec::new(),
        }
    }
}

impl<S: Connection, R: RemoteCache> Registry<S, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage pool under `name` (entities default to `"default"`).
    pub fn register_storage_pool(mut self, name: impl Into<String>, pool: Pool<S>) -> Self {
        self.storage.insert(name.into(), pool);
        self
    }

    /// Register a local cache pool; `None` takes the engine default capacity.
    pub fn register_local_cache(mut self, name: impl Into<String>, capacity: Option<usize>) -> Self {
        self.local.push((name.into(), capacity));
        self
    }

    pub fn register_remote_cache(mut self, name: impl Into<String>, pool: Pool<R>) -> Self {
        self.remote.insert(name.into(), pool);
        self
    }

    pub fn register<E: Entity>(mut self) -> Self {
        self.entities.push(EntityMeta::for_type::<E>(Hooks::default()));
        self
    }

    /// Register a type together with its lifecycle hooks.
    pub fn register_with_events<E: EntityEvents>(mut self) -> Self {
        self.entities.push(EntityMeta::for_type::<E>(Hooks::of::<E>()));
        self
    }

    /// Validate everything and build the engine.
    #[allow(clippy::result_large_err)]
    pub fn build(self, config: EngineConfig) -> Result<Engine<S, R>> {
        let Registry {
            storage,
            local,
            remote,
            mut entities,
        } = self;

        let mut local_caches = HashMap::new();
        for (name, capacity) in local {
            let capacity = capacity.unwrap_or(config.local_cache_capacity);
            if local_caches
                .insert(name.clone(), LocalCache::new(name.clone(), capacity))
                .is_some()
            {
                return Err(duplicate(format!("local cache '{}' registered twice", name)));
            }
        }

        let mut names = HashMap::new();
        let mut types = HashMap::new();
        for meta in &entities {
            meta.schema.validate()?;
            if names.insert(meta.name, ()).is_some() {
                return Err(duplicate(format!("entity '{}' registered twice", meta.name)));
            }
            if types.insert(meta.type_id, ()).is_some() {
                return Err(duplicate(format!("type of '{}' registered twice", meta.name)));
            }
            if !storage.contains_key(meta.schema.storage_pool) {
                return Err(unknown_pool(meta.name, "storage", meta.schema.storage_pool));
            }
            if let Some(pool) = meta.schema.local_cache {
                if !local_caches.contains_key(pool) {
                    return Err(unknown_pool(meta.name, "local cache", pool));
                }
            }
            if let Some(pool) = meta.schema.remote_cache {
                if !remote.contains_key(pool) {
                    return Err(unknown_pool(meta.name, "remote cache", pool));
                }
            }
        }

        let mut children: HashMap<&'static str, Vec<ChildRef>> = HashMap::new();
        for meta in &entities {
            for column in meta.schema.references() {
                let Some(target) = column.references else {
                    continue;
                };
                if !names.contains_key(target) {
                    return Err(Error::Schema(SchemaError {
                        kind: SchemaErrorKind::UnknownReference,
                        message: format!(
                            "{}.{} references unregistered entity '{}'",
                            meta.name, column.name, target
                        ),
                    }));
                }
                children.entry(target).or_default().push(ChildRef {
                    entity: meta.name,
                    column: column.name,
                    action: column.on_delete,
                });
            }
        }
        for meta in &mut entities {
            meta.children = children.remove(meta.name).unwrap_or_default();
        }

        if config.default_max_rows == 0 {
            return Err(Error::Config(tierdb_core::ConfigError {
                message: "default_max_rows must be positive".to_string(),
            }));
        }

        for meta in &entities {
            tracing::debug!(
                entity = meta.name,
                table = meta.schema.table,
                fingerprint = %meta.fingerprint,
                children = meta.children.len(),
                cached_queries = meta.schema.cached_queries.len(),
                hooks = !meta.hooks.is_empty(),
                "Registered entity"
            );
        }

        Ok(Engine::from_parts(
            config,
            storage,
            local_caches,
            remote,
            entities.into_iter().map(Arc::new).collect(),
        ))
    }
}

fn duplicate(message: String) -> Error {
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::Duplicate,
        message,
    })
}

fn unknown_pool(entity: &str, kind: &str, pool: &str) -> Error {
    Error::Schema(SchemaError {
        kind: SchemaErrorKind::UnknownPool,
        message: format!("{} uses unregistered {} pool '{}'", entity, kind, pool),
    })
}

/// Error for a pool name that was never registered.
pub(crate) fn missing_pool(kind: &str, name: &str) -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Unknown,
        message: format!("no {} pool named '{}'", kind, name),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tierdb_core::{Column, DEFAULT_POOL, Entity, EntitySchema, Row, SqlType};
    use tierdb_memory::{MemoryRemoteCache, MemoryStorage};

    use super::*;
    use crate::test_support::Person;

    struct Orphan {
        id: u64,
        owner: u64,
    }

    impl Entity for Orphan {
        const ENTITY_NAME: &'static str = "Orphan";

        fn schema() -> EntitySchema {
            EntitySchema::new("orphans").column(Column::reference("owner_id", "Nobody"))
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

    type TestRegistry = Registry<MemoryStorage, MemoryRemoteCache>;

    fn pools() -> TestRegistry {
        Registry::new()
            .register_storage_pool(DEFAULT_POOL, Pool::shared(Arc::new(MemoryStorage::new())))
            .register_local_cache("local", Some(16))
            .register_remote_cache("default", Pool::shared(Arc::new(MemoryRemoteCache::new())))
    }

    fn schema_kind(result: Result<Engine<MemoryStorage, MemoryRemoteCache>>) -> SchemaErrorKind {
        match result {
            Err(Error::Schema(e)) => e.kind,
            Err(other) => std::panic::panic_any(format!("unexpected error: {other}")),
            Ok(_) => std::panic::panic_any("registry built".to_string()),
        }
    }

    #[test]
    fn builds_with_every_pool_present() {
        let engine = pools().register::<Person>().build(EngineConfig::default()).unwrap();
        let meta = engine.meta::<Person>().unwrap();
        assert_eq!(meta.name, "Person");
        assert!(engine.has_remote_tier(&meta));
        assert_eq!(engine.local_cache("local").unwrap().capacity(), 16);
        assert!(engine.meta_by_name("Nobody").is_err());
    }

    #[test]
    fn missing_pools_are_rejected() {
        let no_remote: TestRegistry = Registry::new()
            .register_storage_pool(DEFAULT_POOL, Pool::shared(Arc::new(MemoryStorage::new())))
            .register_local_cache("local", None)
            .register::<Person>();
        assert_eq!(
            schema_kind(no_remote.build(EngineConfig::default())),
            SchemaErrorKind::UnknownPool
        );
    }

    #[test]
    fn duplicates_and_dangling_references_are_rejected() {
        let twice = pools().register::<Person>().register::<Person>();
        assert_eq!(
            schema_kind(twice.build(EngineConfig::default())),
            SchemaErrorKind::Duplicate
        );

        let dangling = pools().register::<Orphan>();
        assert_eq!(
            schema_kind(dangling.build(EngineConfig::default())),
            SchemaErrorKind::UnknownReference
        );
    }

    #[test]
    fn zero_default_ceiling_is_a_config_error() {
        let result = pools()
            .register::<Person>()
            .build(EngineConfig::default().default_max_rows(0));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
