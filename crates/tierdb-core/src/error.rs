//! Error types for tierdb operations.

use std::fmt;

/// The primary error type for all tierdb operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Statement execution errors reported by a backend
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Pool errors
    Pool(PoolError),
    /// Schema registration errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// A foreign key constraint would be broken by the flush
    ForeignKeyViolation(ForeignKeyError),
    /// A unique index already holds the written value
    DuplicateUniqueKey(UniqueKeyError),
    /// A required column holds its zero value
    RequiredFieldMissing { entity: String, column: String },
    /// A must-exist load found nothing
    EntityNotFound { entity: String, id: u64 },
    /// The entity type was never registered with the engine
    EntityNotRegistered(String),
    /// A cached query would return more rows than its ceiling allows
    IndexCapacityExceeded { index: String, ceiling: usize },
    /// The lock request itself was invalid
    LockAcquisition(String),
    /// Serialization/deserialization errors (cache payloads, queue messages)
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    /// Backend detail; for constraint errors, the constraint name.
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed statement
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Statement timeout
    Timeout,
    /// Other backend error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No pool registered under the requested name
    Unknown,
    /// Pool has no handles
    Empty,
    /// Every handle stayed busy past the acquire timeout
    Exhausted,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table, column, index or channel name is not a valid identifier
    InvalidIdentifier,
    /// An index or template names a column the entity does not have
    ColumnNotFound,
    /// A reference column points to an unregistered entity
    UnknownReference,
    /// The entity names a pool that was never registered
    UnknownPool,
    /// Two definitions share one name
    Duplicate,
    /// Any other invalid definition
    Invalid,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

/// Which side of a foreign key broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyErrorKind {
    /// The referenced parent row does not exist
    MissingParent,
    /// A RESTRICT child still references the row being deleted
    RestrictedChildren,
}

#[derive(Debug)]
pub struct ForeignKeyError {
    pub kind: ForeignKeyErrorKind,
    /// Entity holding the reference column
    pub entity: String,
    /// Reference column
    pub column: String,
    /// Entity the column points to
    pub referenced: String,
    /// Id of the row that could not be written or deleted
    pub id: u64,
}

#[derive(Debug)]
pub struct UniqueKeyError {
    pub entity: String,
    pub index: String,
    /// Id of the row already holding the value, when known
    pub existing_id: Option<u64>,
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl Error {
    /// Get SQLSTATE if present.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the statement that failed, if known.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Translate a backend constraint error into the typed taxonomy.
    ///
    /// `entity` names the entity whose statement failed and `id` the row.
    /// Anything that is not a recognised constraint error is returned as is.
    #[must_use]
    pub fn translate_backend(self, entity: &str, id: u64) -> Error {
        match self {
            Error::Query(q) if q.is_unique_violation() => {
                Error::DuplicateUniqueKey(UniqueKeyError {
                    entity: entity.to_string(),
                    index: q.detail.unwrap_or_default(),
                    existing_id: None,
                })
            }
            Error::Query(q) if q.is_foreign_key_violation() => {
                Error::ForeignKeyViolation(ForeignKeyError {
                    kind: ForeignKeyErrorKind::MissingParent,
                    entity: entity.to_string(),
                    column: q.detail.unwrap_or_default(),
                    referenced: String::new(),
                    id,
                })
            }
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::ForeignKeyViolation(e) => write!(f, "Foreign key violation: {}", e),
            Error::DuplicateUniqueKey(e) => write!(f, "Duplicate unique key: {}", e),
            Error::RequiredFieldMissing { entity, column } => {
                write!(f, "Required field missing: {}.{}", entity, column)
            }
            Error::EntityNotFound { entity, id } => {
                write!(f, "Entity not found: {} with id {}", entity, id)
            }
            Error::EntityNotRegistered(name) => write!(f, "Entity not registered: {}", name),
            Error::IndexCapacityExceeded { index, ceiling } => write!(
                f,
                "Cached query '{}' exceeds its ceiling of {} rows",
                index, ceiling
            ),
            Error::LockAcquisition(msg) => write!(f, "Lock acquisition error: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ForeignKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ForeignKeyErrorKind::MissingParent => write!(
                f,
                "{} {} references missing {} through '{}'",
                self.entity, self.id, self.referenced, self.column
            ),
            ForeignKeyErrorKind::RestrictedChildren => write!(
                f,
                "{} {} is still referenced by {}.{}",
                self.referenced, self.id, self.entity, self.column
            ),
        }
    }
}

impl fmt::Display for UniqueKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.existing_id {
            Some(id) => write!(
                f,
                "{} index '{}' already holds the value (id {})",
                self.entity, self.index, id
            ),
            None => write!(
                f,
                "{} index '{}' already holds the value",
                self.entity, self.index
            ),
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for tierdb operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn constraint(sqlstate: &str, detail: &str) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO \"users\"".to_string()),
            sqlstate: Some(sqlstate.to_string()),
            message: "constraint failed".to_string(),
            detail: Some(detail.to_string()),
            source: None,
        })
    }

    #[test]
    fn sqlstate_helpers() {
        let err = constraint("23505", "uniq_email");
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("INSERT INTO \"users\""));
    }

    #[test]
    fn unique_violation_translates() {
        let err = constraint("23505", "uniq_email").translate_backend("User", 3);
        match err {
            Error::DuplicateUniqueKey(e) => {
                assert_eq!(e.entity, "User");
                assert_eq!(e.index, "uniq_email");
                assert_eq!(e.existing_id, None);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn foreign_key_violation_translates() {
        let err = constraint("23503", "owner").translate_backend("Pet", 9);
        assert!(matches!(
            err,
            Error::ForeignKeyViolation(ForeignKeyError {
                kind: ForeignKeyErrorKind::MissingParent,
                id: 9,
                ..
            })
        ));
    }

    #[test]
    fn other_errors_pass_through() {
        let err = Error::Custom("network down".into()).translate_backend("User", 1);
        assert_eq!(err.to_string(), "network down");
    }

    #[test]
    fn capacity_message_names_index_and_ceiling() {
        let err = Error::IndexCapacityExceeded {
            index: "IndexAge".into(),
            ceiling: 50_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("IndexAge"));
        assert!(msg.contains("50000"));
    }
}
