//! Cache tiers and the cached query index for tierdb.
//!
//! `tierdb-cache` is the **shared layer** every session works through. It
//! owns the registered entity metadata and the pools, and keeps the local
//! and remote cache tiers consistent with storage.
//!
//! # Role In The Architecture
//!
//! - **Registry / Engine**: entity types and pools are registered once and
//!   validated together; the resulting [`Engine`] is immutable and cheap to clone.
//! - **Cache coordinator**: read-through local → remote → storage with
//!   promotion and tombstones, write-through on flush.
//! - **Cached query index**: ordered id lists for named queries, sliced
//!   into pages locally and invalidated by row changes.
//! - **Dirty events**: per-channel change batches appended to streams.
//!
//! Sessions (`tierdb-session`) and the deferred writers (`tierdb-deferred`)
//! are built on top of this crate.

pub mod changes;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod keys;
pub mod local;
pub mod query_index;
pub mod registry;

pub use changes::{ChangeKind, RowChange};
pub use config::{DEFAULT_MAX_ROWS, EngineConfig};
pub use engine::{CacheStats, Engine};
pub use events::{DirtyEntry, DirtyEvent, collect_dirty_events};
pub use keys::{CacheEntry, args_fingerprint, entity_key, index_key};
pub use local::LocalCache;
pub use query_index::{Pager, affected_index_keys};
pub use registry::{ChildRef, EntityMeta, Hook, Hooks, Registry};

#[cfg(test)]
pub(crate) mod test_support {
    use tierdb_core::{
        CachedQuery, Column, DirtyChannel, Entity, EntitySchema, Result, Row, SqlType, Value,
    };

    #[derive(Debug, Clone, PartialEq)]
    pub struct Person {
        pub id: u64,
        pub name: String,
        pub age: i32,
    }

    impl Person {
        pub fn new(name: &str, age: i32) -> Self {
            Self {
                id: 0,
                name: name.to_string(),
                age,
            }
        }
    }

    impl Entity for Person {
        const ENTITY_NAME: &'static str = "Person";

        fn schema() -> EntitySchema {
            EntitySchema::new("people")
                .column(Column::new("name", SqlType::Text).required())
                .column(Column::new("age", SqlType::Integer))
                .fake_delete()
                .local_cache("local")
                .remote_cache("default")
                .cached_query(CachedQuery::many("IndexAge").filter_eq("age"))
                .cached_query(CachedQuery::many("All"))
                .dirty_channel(DirtyChannel::new("people"))
                .dirty_channel(DirtyChannel::new("ages").columns(&["age"]))
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
}
