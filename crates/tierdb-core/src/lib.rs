//! Core types and traits for tierdb.
//!
//! This crate provides the foundations every other layer builds on:
//!
//! - `Entity` trait and the `EntitySchema` descriptor built once per type
//! - `Value` / `Row` for column data
//! - structured `Statement`s handed to storage backends
//! - `Connection` and `RemoteCache` backend traits
//! - the crate-wide `Error` taxonomy
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod entity;
pub mod error;
pub mod identifiers;
pub mod row;
pub mod schema;
pub mod statement;
pub mod types;
pub mod value;

pub use connection::{Connection, ExecResult, RemoteCache};
pub use entity::{Entity, EntityEvents};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ForeignKeyError,
    ForeignKeyErrorKind, PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result,
    SchemaError, SchemaErrorKind, TypeError, UniqueKeyError,
};
pub use identifiers::{is_valid_identifier, quote_ident, validate_identifier};
pub use row::{ColumnInfo, FromValue, Row};
pub use schema::{
    CachedQuery, Column, DEFAULT_POOL, DirtyChannel, EntitySchema, FAKE_DELETE_COLUMN,
    QueryMode, ReferentialAction, SortKey, UniqueIndex,
};
pub use statement::{Condition, Statement};
pub use types::SqlType;
pub use value::Value;
