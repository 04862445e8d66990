//! The immutable engine shared by every session.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use asupersync::{Cx, Outcome};
use tierdb_core::{
    Connection, Entity, Error, ExecResult, RemoteCache, Result, Row, Statement, try_outcome,
};
use tierdb_pool::Pool;

use crate::config::EngineConfig;
use crate::local::LocalCache;
use crate::registry::{EntityMeta, missing_pool};

/// Cache effectiveness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub remote_hits: u64,
    /// Batched storage loads issued by the coordinator.
    pub storage_loads: u64,
    pub index_hits: u64,
    pub index_rebuilds: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) local_hits: AtomicU64,
    pub(crate) remote_hits: AtomicU64,
    pub(crate) storage_loads: AtomicU64,
    pub(crate) index_hits: AtomicU64,
    pub(crate) index_rebuilds: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

struct EngineInner<S, R> {
    config: EngineConfig,
    storage: HashMap<String, Pool<S>>,
    local: HashMap<String, LocalCache>,
    remote: HashMap<String, Pool<R>>,
    by_type: HashMap<TypeId, Arc<EntityMeta>>,
    by_name: HashMap<&'static str, Arc<EntityMeta>>,
    stats: StatsCounters,
}

/// Registered entity types plus the pools and cache tiers they live in.
///
/// Built once by [`crate::Registry::build`]; clones share everything.
pub struct Engine<S, R> {
    inner: Arc<EngineInner<S, R>>,
}

impl<S, R> Clone for Engine<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, R> std::fmt::Debug for Engine<S, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.inner.by_name.keys().collect();
        names.sort();
        f.debug_struct("Engine")
            .field("entities", &names)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<S: Connection, R: RemoteCache> Engine<S, R> {
    pub(crate) fn from_parts(
        config: EngineConfig,
        storage: HashMap<String, Pool<S>>,
        local: HashMap<String, LocalCache>,
        remote: HashMap<String, Pool<R>>,
        entities: Vec<Arc<EntityMeta>>,
    ) -> Self {
        let by_type = entities
            .iter()
            .map(|meta| (meta.type_id, Arc::clone(meta)))
            .collect();
        let by_name = entities
            .into_iter()
            .map(|meta| (meta.name, meta))
            .collect();
        Self {
            inner: Arc::new(EngineInner {
                config,
                storage,
                local,
                remote,
                by_type,
                by_name,
                stats: StatsCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Metadata of a registered type.
    #[allow(clippy::result_large_err)]
    pub fn meta<E: Entity>(&self) -> Result<Arc<EntityMeta>> {
        self.inner
            .by_type
            .get(&TypeId::of::<E>())
            .cloned()
            .ok_or_else(|| Error::EntityNotRegistered(std::any::type_name::<E>().to_string()))
    }

    #[allow(clippy::result_large_err)]
    pub fn meta_by_name(&self, name: &str) -> Result<Arc<EntityMeta>> {
        self.inner
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::EntityNotRegistered(name.to_string()))
    }

    pub fn meta_by_type_id(&self, type_id: TypeId) -> Option<Arc<EntityMeta>> {
        self.inner.by_type.get(&type_id).cloned()
    }

    /// Remote cache pool holding the deferred queues and dirty streams.
    #[allow(clippy::result_large_err)]
    pub fn queue_pool(&self) -> Result<&Pool<R>> {
        let name = &self.inner.config.queue_pool;
        self.inner
            .remote
            .get(name)
            .ok_or_else(|| missing_pool("remote cache", name))
    }

    pub fn local_cache(&self, name: &str) -> Option<&LocalCache> {
        self.inner.local.get(name)
    }

    /// Counters since the engine was built.
    pub fn stats(&self) -> CacheStats {
        let s = &self.inner.stats;
        CacheStats {
            local_hits: s.local_hits.load(Ordering::Relaxed),
            remote_hits: s.remote_hits.load(Ordering::Relaxed),
            storage_loads: s.storage_loads.load(Ordering::Relaxed),
            index_hits: s.index_hits.load(Ordering::Relaxed),
            index_rebuilds: s.index_rebuilds.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.inner.stats
    }

    pub(crate) fn local_tier(&self, meta: &EntityMeta) -> Option<&LocalCache> {
        meta.schema
            .local_cache
            .and_then(|name| self.inner.local.get(name))
    }

    pub(crate) fn remote_tier(&self, meta: &EntityMeta) -> Option<&Pool<R>> {
        meta.schema
            .remote_cache
            .and_then(|name| self.inner.remote.get(name))
    }

    /// Does the type live in the remote tier?
    pub fn has_remote_tier(&self, meta: &EntityMeta) -> bool {
        self.remote_tier(meta).is_some()
    }

    #[allow(clippy::result_large_err)]
    fn storage_for(&self, meta: &EntityMeta) -> Result<&Pool<S>> {
        self.inner
            .storage
            .get(meta.schema.storage_pool)
            .ok_or_else(|| missing_pool("storage", meta.schema.storage_pool))
    }

    /// Run a select against the type's storage pool.
    pub async fn query(&self, cx: &Cx, meta: &EntityMeta, stmt: &Statement) -> Outcome<Vec<Row>, Error> {
        let pool = tierdb_core::try_result!(self.storage_for(meta));
        let conn = try_outcome!(pool.acquire(cx).await);
        match conn.query(cx, stmt).await {
            Outcome::Ok(rows) => {
                tracing::debug!(
                    target: "tierdb::storage",
                    op = stmt.kind(),
                    table = stmt.table(),
                    sql = %stmt.to_sql(),
                    rows = rows.len(),
                    "statement"
                );
                Outcome::Ok(rows)
            }
            Outcome::Err(e) => {
                tracing::debug!(
                    target: "tierdb::storage",
                    op = stmt.kind(),
                    table = stmt.table(),
                    sql = %stmt.to_sql(),
                    error = %e,
                    "statement failed"
                );
                Outcome::Err(e)
            }
            other => other,
        }
    }

    /// Run a write against the type's storage pool.
    ///
    /// Constraint violations come back translated for `meta` and `id`.
    pub async fn execute(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        id: u64,
        stmt: &Statement,
    ) -> Outcome<ExecResult, Error> {
        let pool = tierdb_core::try_result!(self.storage_for(meta));
        let conn = try_outcome!(pool.acquire(cx).await);
        match conn.execute(cx, stmt).await {
            Outcome::Ok(result) => {
                tracing::debug!(
                    target: "tierdb::storage",
                    op = stmt.kind(),
                    table = stmt.table(),
                    sql = %stmt.to_sql(),
                    rows = result.rows_affected,
                    "statement"
                );
                Outcome::Ok(result)
            }
            Outcome::Err(e) => {
                tracing::debug!(
                    target: "tierdb::storage",
                    op = stmt.kind(),
                    table = stmt.table(),
                    sql = %stmt.to_sql(),
                    error = %e,
                    "statement failed"
                );
                Outcome::Err(e.translate_backend(meta.name, id))
            }
            other => other,
        }
    }
}
