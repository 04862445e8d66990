//! In-process backends for tierdb.
//!
//! [`MemoryStorage`] implements `Connection` and [`MemoryRemoteCache`]
//! implements `RemoteCache`. Both are thread-safe, so one instance can back
//! a whole pool. They serve tests and single-process deployments; counters
//! let callers observe how many round trips an operation cost.
//!
//! # Example
//!
//! ```rust,ignore
//! use tierdb_memory::{MemoryRemoteCache, MemoryStorage};
//! use tierdb_pool::Pool;
//!
//! let storage = MemoryStorage::new();
//! storage.create_table(&Person::schema())?;
//! let storage = Pool::single(storage);
//! let remote = Pool::single(MemoryRemoteCache::new());
//! ```

pub mod remote;
pub mod storage;

pub use remote::MemoryRemoteCache;
pub use storage::MemoryStorage;
