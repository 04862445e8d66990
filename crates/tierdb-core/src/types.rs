//! Column type definitions.

use crate::value::Value;

/// Column data types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Text,
    VarChar(u32),
    Blob,
    Timestamp,
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Text => "TEXT".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(SqlType::VarChar(32).sql_name(), "VARCHAR(32)");
        assert_eq!(SqlType::Double.sql_name(), "DOUBLE PRECISION");
    }
}
