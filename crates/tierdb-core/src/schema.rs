//! Per-entity schema descriptors.
//!
//! An [`EntitySchema`] is built once per entity type at registration and
//! carries everything the engine needs: columns, unique indices, reference
//! actions, cache-tier assignment, cached-query templates and dirty
//! channels. Nothing is discovered reflectively at call time.

use std::collections::HashSet;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::Result;
use crate::error::{Error, SchemaError, SchemaErrorKind};
use crate::identifiers::validate_identifier;
use crate::types::SqlType;

/// Name of the storage pool used when a schema does not pick one.
pub const DEFAULT_POOL: &str = "default";

/// Column that carries the logical-deletion flag.
pub const FAKE_DELETE_COLUMN: &str = "fake_delete";

/// Delete-propagation policy on a reference column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum ReferentialAction {
    /// Refuse to delete a parent that still has children.
    #[default]
    Restrict,
    /// Delete the children together with the parent.
    Cascade,
}

impl ReferentialAction {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
        }
    }
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    /// A required column may not hold its type's zero value on write.
    pub required: bool,
    /// Entity name this column points to, for reference columns.
    pub references: Option<&'static str>,
    pub on_delete: ReferentialAction,
}

impl Column {
    pub const fn new(name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            sql_type,
            required: false,
            references: None,
            on_delete: ReferentialAction::Restrict,
        }
    }

    /// A reference column holding the id of an `entity` row.
    ///
    /// Zero means "no reference".
    pub const fn reference(name: &'static str, entity: &'static str) -> Self {
        Self {
            name,
            sql_type: SqlType::BigInt,
            required: false,
            references: Some(entity),
            on_delete: ReferentialAction::Restrict,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub const fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }
}

/// A unique index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
}

/// Whether a cached query resolves to a list or to at most one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Many,
    One,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: &'static str,
    pub descending: bool,
}

/// A named, parameterized query whose id list is cached.
///
/// Filters are equality terms bound positionally to the search arguments.
/// A query with no filters caches "all rows" of the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedQuery {
    pub name: &'static str,
    pub mode: QueryMode,
    pub filters: Vec<&'static str>,
    pub order: Vec<SortKey>,
    /// Ceiling override; the engine default applies when `None`.
    pub max_rows: Option<usize>,
}

impl CachedQuery {
    /// A multi-row query.
    pub fn many(name: &'static str) -> Self {
        Self {
            name,
            mode: QueryMode::Many,
            filters: Vec::new(),
            order: Vec::new(),
            max_rows: None,
        }
    }

    /// A "find one" query.
    pub fn one(name: &'static str) -> Self {
        Self {
            mode: QueryMode::One,
            ..Self::many(name)
        }
    }

    /// Add a `column = ?` term.
    pub fn filter_eq(mut self, column: &'static str) -> Self {
        self.filters.push(column);
        self
    }

    pub fn order_by(mut self, column: &'static str) -> Self {
        self.order.push(SortKey {
            column,
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, column: &'static str) -> Self {
        self.order.push(SortKey {
            column,
            descending: true,
        });
        self
    }

    pub fn max_rows(mut self, ceiling: usize) -> Self {
        self.max_rows = Some(ceiling);
        self
    }

    /// Is this the no-filter "all rows" form?
    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty()
    }

    /// Every column the template reads, filters first.
    pub fn template_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.filters
            .iter()
            .copied()
            .chain(self.order.iter().map(|k| k.column))
    }
}

/// A change-data-capture channel an entity publishes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyChannel {
    pub name: &'static str,
    /// Updates only emit when one of these changed; empty means any column.
    pub columns: Vec<&'static str>,
}

impl DirtyChannel {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            columns: Vec::new(),
        }
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = columns.to_vec();
        self
    }
}

/// Complete descriptor of one entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub table: &'static str,
    pub primary_key: &'static str,
    /// Non-key columns, in storage order.
    pub columns: Vec<Column>,
    pub unique: Vec<UniqueIndex>,
    /// Logical-deletion column, when the type uses fake delete.
    pub fake_delete: Option<&'static str>,
    pub storage_pool: &'static str,
    pub local_cache: Option<&'static str>,
    pub remote_cache: Option<&'static str>,
    /// Expiry for cached rows, tombstones and lists; `None` keeps them until evicted.
    pub cache_ttl: Option<Duration>,
    pub cached_queries: Vec<CachedQuery>,
    pub dirty_channels: Vec<DirtyChannel>,
}

impl EntitySchema {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            primary_key: "id",
            columns: Vec::new(),
            unique: Vec::new(),
            fake_delete: None,
            storage_pool: DEFAULT_POOL,
            local_cache: None,
            remote_cache: None,
            cache_ttl: None,
            cached_queries: Vec::new(),
            dirty_channels: Vec::new(),
        }
    }

    pub fn primary_key(mut self, column: &'static str) -> Self {
        self.primary_key = column;
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn unique(mut self, name: &'static str, columns: &[&'static str]) -> Self {
        self.unique.push(UniqueIndex {
            name,
            columns: columns.to_vec(),
        });
        self
    }

    /// Use logical deletion through the `fake_delete` column.
    pub fn fake_delete(mut self) -> Self {
        if !self.columns.iter().any(|c| c.name == FAKE_DELETE_COLUMN) {
            self.columns
                .push(Column::new(FAKE_DELETE_COLUMN, SqlType::Boolean));
        }
        self.fake_delete = Some(FAKE_DELETE_COLUMN);
        self
    }

    pub fn storage_pool(mut self, pool: &'static str) -> Self {
        self.storage_pool = pool;
        self
    }

    pub fn local_cache(mut self, pool: &'static str) -> Self {
        self.local_cache = Some(pool);
        self
    }

    pub fn remote_cache(mut self, pool: &'static str) -> Self {
        self.remote_cache = Some(pool);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn cached_query(mut self, query: CachedQuery) -> Self {
        self.cached_queries.push(query);
        self
    }

    pub fn dirty_channel(mut self, channel: DirtyChannel) -> Self {
        self.dirty_channels.push(channel);
        self
    }

    /// Look up a column by name.
    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Does the type use any cache tier?
    pub fn is_cached(&self) -> bool {
        self.local_cache.is_some() || self.remote_cache.is_some()
    }

    /// Columns holding references to other entities.
    pub fn references(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.references.is_some())
    }

    /// Stable hash of the field layout.
    ///
    /// Embedded in every entity cache key: changing the table name, a
    /// column name or a column type yields a new fingerprint so earlier
    /// cached payloads are never read back with the wrong layout.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.table.as_bytes());
        hasher.update([0]);
        hasher.update(self.primary_key.as_bytes());
        for column in &self.columns {
            hasher.update([0]);
            hasher.update(column.name.as_bytes());
            hasher.update([b':']);
            hasher.update(column.sql_type.sql_name().as_bytes());
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..4])
    }

    /// Validate names and intra-schema references.
    ///
    /// Cross-entity checks (reference targets, pool names) happen when the
    /// registry builds the engine.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        validate_identifier("table", self.table)?;
        validate_identifier("column", self.primary_key)?;

        let mut seen = HashSet::new();
        seen.insert(self.primary_key);
        for column in &self.columns {
            validate_identifier("column", column.name)?;
            if !seen.insert(column.name) {
                return Err(schema_error(
                    SchemaErrorKind::Duplicate,
                    format!("{}: column '{}' declared twice", self.table, column.name),
                ));
            }
        }

        let known = |name: &str| name == self.primary_key || self.column_named(name).is_some();

        for index in &self.unique {
            validate_identifier("index", index.name)?;
            if index.columns.is_empty() {
                return Err(schema_error(
                    SchemaErrorKind::Invalid,
                    format!("{}: unique index '{}' has no columns", self.table, index.name),
                ));
            }
            for column in &index.columns {
                if !known(column) {
                    return Err(missing_column(self.table, index.name, column));
                }
            }
        }

        let mut names = HashSet::new();
        for query in &self.cached_queries {
            validate_identifier("cached query", query.name)?;
            if !names.insert(query.name) {
                return Err(schema_error(
                    SchemaErrorKind::Duplicate,
                    format!("{}: cached query '{}' declared twice", self.table, query.name),
                ));
            }
            if query.max_rows == Some(0) {
                return Err(schema_error(
                    SchemaErrorKind::Invalid,
                    format!("{}: cached query '{}' has a zero ceiling", self.table, query.name),
                ));
            }
            for column in query.template_columns() {
                if !known(column) {
                    return Err(missing_column(self.table, query.name, column));
                }
            }
        }

        for channel in &self.dirty_channels {
            validate_identifier("dirty channel", channel.name)?;
            for column in &channel.columns {
                if !known(column) {
                    return Err(missing_column(self.table, channel.name, column));
                }
            }
        }

        Ok(())
    }
}

fn schema_error(kind: SchemaErrorKind, message: String) -> Error {
    Error::Schema(SchemaError { kind, message })
}

fn missing_column(table: &str, owner: &str, column: &str) -> Error {
    schema_error(
        SchemaErrorKind::ColumnNotFound,
        format!("{}: '{}' uses unknown column '{}'", table, owner, column),
    )
}
