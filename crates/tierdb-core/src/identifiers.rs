//! Identifier validation and quoting.
//!
//! Table, column, index and channel names become part of rendered
//! statements and of persisted cache keys, so they are restricted to a
//! conservative character set once at registration.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, SchemaError, SchemaErrorKind};

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,62}$";

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| match Regex::new(IDENTIFIER_PATTERN) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "identifier pattern failed to compile");
            None
        }
    })
    .as_ref()
}

/// Is `name` usable as a table, column, index or channel name?
pub fn is_valid_identifier(name: &str) -> bool {
    match identifier_regex() {
        Some(re) => re.is_match(name),
        None => false,
    }
}

/// Validate an identifier, naming what it identifies in the error.
#[allow(clippy::result_large_err)]
pub fn validate_identifier(what: &str, name: &str) -> crate::Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(Error::Schema(SchemaError {
            kind: SchemaErrorKind::InvalidIdentifier,
            message: format!("invalid {} name '{}'", what, name),
        }))
    }
}

/// Quote an identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them.
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("IndexAge"));
        assert!(is_valid_identifier("order_items_2"));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("user name"));
        assert!(!is_valid_identifier("users;DROP"));
        assert!(!is_valid_identifier("a:b"));
        assert!(!is_valid_identifier(&"x".repeat(64)));
    }

    #[test]
    fn validate_names_the_kind() {
        let err = validate_identifier("index", "bad name").unwrap_err();
        assert!(err.to_string().contains("invalid index name 'bad name'"));
    }

    #[test]
    fn quoting_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
    }
}
