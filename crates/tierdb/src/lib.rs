//! tierdb - a unit-of-work ORM engine with tiered entity caches.
//!
//! Entities are loaded and changed through a [`Session`], which keeps one
//! instance per stored row and writes every change in a single validated
//! flush. Reads go through a local in-process tier, then a shared remote
//! tier, then storage; multi-row lookups are served from cached id lists
//! ("cached queries") that flushes invalidate precisely.
//!
//! - Lazy flush and cache-ahead flush defer storage writes to a queue
//!   ([`flush_lazy`], [`flush_cache_ahead`]).
//! - Every flush publishes change events per dirty channel ([`DirtyReceiver`]).
//! - A [`Locker`] hands out distributed locks for single-consumer work.
//!
//! # Quick Start
//!
//! ```ignore
//! use tierdb::prelude::*;
//!
//! let engine = Registry::new()
//!     .register_storage_pool(DEFAULT_POOL, Pool::single(storage))
//!     .register_local_cache("local", None)
//!     .register_remote_cache("default", Pool::single(remote))
//!     .register::<Person>()
//!     .build(EngineConfig::default())?;
//!
//! let mut session = Session::new(&engine);
//! let alice = session.track(Person::new("alice", 10))?;
//! session.flush(&cx).await?;
//!
//! let page = session
//!     .cached_search::<Person>(&cx, "IndexAge", &[Value::Int(10)], Pager::new(1, 20))
//!     .await?;
//! ```

pub use tierdb_core::{
    CachedQuery, Column, Condition, Connection, Cx, DEFAULT_POOL, DirtyChannel, Entity,
    EntityEvents, EntitySchema, Error, ExecResult, FAKE_DELETE_COLUMN, ForeignKeyError,
    ForeignKeyErrorKind, Outcome, QueryMode, ReferentialAction, RemoteCache, Result, Row,
    SchemaError, SchemaErrorKind, SortKey, SqlType, Statement, UniqueIndex, UniqueKeyError, Value,
};

pub use tierdb_pool::{Pool, PoolConfig, PoolStats, PooledConnection};

pub use tierdb_cache::{
    CacheStats, ChangeKind, DEFAULT_MAX_ROWS, DirtyEntry, DirtyEvent, Engine, EngineConfig,
    EntityMeta, Pager, Registry, RowChange,
};

pub use tierdb_session::{
    FlushOptions, FlushSummary, Handle, ObjectKey, ObjectState, SearchPage, Session,
};

pub use tierdb_deferred::{
    CacheAheadReceiver, DirtyReceiver, LazyReceiver, flush_cache_ahead, flush_lazy,
    flush_lazy_with,
};

pub use tierdb_lock::{Lock, LockConfig, Locker};

pub use tierdb_memory::{MemoryRemoteCache, MemoryStorage};

/// An engine over the in-process backends.
pub type MemoryEngine = Engine<MemoryStorage, MemoryRemoteCache>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tierdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Schema
        CachedQuery,
        Column,
        // Backends
        Connection,
        Cx,
        DEFAULT_POOL,
        DirtyChannel,
        // Engine
        Engine,
        EngineConfig,
        Entity,
        EntityEvents,
        EntitySchema,
        Error,
        // Session
        FlushOptions,
        Handle,
        Outcome,
        Pager,
        Pool,
        PoolConfig,
        Registry,
        RemoteCache,
        Result,
        Row,
        Session,
        SqlType,
        Value,
    };
}
