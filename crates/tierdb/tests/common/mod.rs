#![allow(dead_code)]

use std::sync::Arc;

use tierdb::prelude::*;
use tierdb::{
    DirtyChannel, MemoryEngine, MemoryRemoteCache, MemoryStorage, ReferentialAction,
};

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got {other:?}")),
    }
}

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
            .cached_query(CachedQuery::many("ByName").order_by("name"))
            .cached_query(CachedQuery::many("Capped").filter_eq("age").max_rows(2))
            .cached_query(CachedQuery::one("OneByName").filter_eq("name"))
            .dirty_channel(DirtyChannel::new("people"))
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

#[derive(Debug, Clone, PartialEq)]
pub struct Pet {
    pub id: u64,
    pub owner: u64,
    pub name: String,
}

impl Pet {
    pub fn new(owner: u64, name: &str) -> Self {
        Self {
            id: 0,
            owner,
            name: name.to_string(),
        }
    }
}

impl Entity for Pet {
    const ENTITY_NAME: &'static str = "Pet";

    fn schema() -> EntitySchema {
        EntitySchema::new("pets")
            .column(
                Column::reference("owner_id", "Person")
                    .required()
                    .on_delete(ReferentialAction::Cascade),
            )
            .column(Column::new("name", SqlType::Text).required())
            .local_cache("local")
            .cached_query(CachedQuery::many("ByOwner").filter_eq("owner_id"))
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("owner_id", Value::from(self.owner)),
            ("name", Value::from(self.name.as_str())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            owner: row.get_named("owner_id")?,
            name: row.get_named("name")?,
        })
    }
}

/// A person's badge; people holding one cannot be deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Badge {
    pub id: u64,
    pub holder: u64,
    pub label: String,
}

impl Badge {
    pub fn new(holder: u64, label: &str) -> Self {
        Self {
            id: 0,
            holder,
            label: label.to_string(),
        }
    }
}

impl Entity for Badge {
    const ENTITY_NAME: &'static str = "Badge";

    fn schema() -> EntitySchema {
        EntitySchema::new("badges")
            .column(
                Column::reference("holder_id", "Person")
                    .required()
                    .on_delete(ReferentialAction::Restrict),
            )
            .column(Column::new("label", SqlType::Text).required())
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("holder_id", Value::from(self.holder)),
            ("label", Value::from(self.label.as_str())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            holder: row.get_named("holder_id")?,
            label: row.get_named("label")?,
        })
    }
}

pub struct Fixture {
    pub engine: MemoryEngine,
    pub storage: Arc<MemoryStorage>,
    pub remote: Arc<MemoryRemoteCache>,
}

pub fn fixture() -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    storage.create_table(&Person::schema()).expect("create people");
    storage.create_table(&Pet::schema()).expect("create pets");
    storage.create_table(&Badge::schema()).expect("create badges");
    let remote = Arc::new(MemoryRemoteCache::new());
    let engine = Registry::new()
        .register_storage_pool(DEFAULT_POOL, Pool::shared(Arc::clone(&storage)))
        .register_local_cache("local", None)
        .register_remote_cache("default", Pool::shared(Arc::clone(&remote)))
        .register::<Person>()
        .register::<Pet>()
        .register::<Badge>()
        .build(EngineConfig::default())
        .expect("build engine");
    Fixture {
        engine,
        storage,
        remote,
    }
}

/// Insert people and return their ids in order.
pub async fn seed(engine: &MemoryEngine, cx: &Cx, people: &[(&str, i32)]) -> Vec<u64> {
    let mut session = Session::new(engine);
    let handles: Vec<Handle<Person>> = people
        .iter()
        .map(|(name, age)| session.track(Person::new(name, *age)).expect("track"))
        .collect();
    unwrap_outcome(session.flush(cx).await);
    handles
        .into_iter()
        .map(|h| session.get(h).expect("tracked").id)
        .collect()
}
