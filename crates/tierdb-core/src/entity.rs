//! Entity trait for record-to-row mapping.
//!
//! Entities are plain values. Identity, snapshots, dirty flags and the
//! fake-delete flag live in the session that tracks them, not in the
//! record itself.

use crate::Result;
use crate::row::Row;
use crate::schema::EntitySchema;
use crate::value::Value;

/// Trait for types stored by the engine.
///
/// # Example
///
/// ```
/// use tierdb_core::{Column, Entity, EntitySchema, Result, Row, SqlType, Value};
///
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// impl Entity for User {
///     const ENTITY_NAME: &'static str = "User";
///
///     fn schema() -> EntitySchema {
///         EntitySchema::new("users").column(Column::new("name", SqlType::Text).required())
///     }
///
///     fn id(&self) -> u64 {
///         self.id
///     }
///
///     fn set_id(&mut self, id: u64) {
///         self.id = id;
///     }
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("name", Value::from(self.name.as_str()))]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_named("id")?,
///             name: row.get_named("name")?,
///         })
///     }
/// }
/// ```
pub trait Entity: Sized + Send + Sync + 'static {
    /// Registration name, used by reference columns and error messages.
    const ENTITY_NAME: &'static str;

    /// Build the schema descriptor. Called once at registration.
    fn schema() -> EntitySchema;

    /// Primary key; zero until the entity has been inserted.
    fn id(&self) -> u64;

    /// Assign the primary key after insert.
    fn set_id(&mut self, id: u64);

    /// Non-key column values. Columns not listed are written as NULL.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Rebuild the entity from a row that includes the primary key.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;
}

/// Optional lifecycle hooks.
///
/// Register the type with `register_with_events` to have these called;
/// the capability is recorded once at registration. Returning an error
/// from a `before_*` hook aborts the whole flush before any write.
pub trait EntityEvents: Entity {
    /// Called before a new entity is inserted.
    #[allow(clippy::result_large_err)]
    fn before_insert(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before a changed entity is updated.
    #[allow(clippy::result_large_err)]
    fn before_update(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called before a physical or logical delete.
    #[allow(clippy::result_large_err)]
    fn before_delete(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called after the flush that wrote this entity succeeded.
    #[allow(clippy::result_large_err)]
    fn after_saved(&mut self) -> Result<()> {
        Ok(())
    }
}
