//! Identifier validation for generated DDL
//!
//! Table, column and index names are interpolated into DDL text, so every name
//! that reaches the [`DdlBuilder`](crate::migrations::DdlBuilder) or the
//! bookkeeping queries is validated first.

use crate::error::{MigrationError, MigrationResult};

/// Characters allowed in SQL identifiers (alphanumeric, underscore, dollar)
const ALLOWED_IDENTIFIER_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_$";

/// Longest identifier accepted by every supported backend (PostgreSQL: 63)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL keywords that cannot be used as bare identifiers
static SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "FROM", "WHERE", "JOIN", "UNION", "DROP", "CREATE",
    "ALTER", "GRANT", "REVOKE", "TRUNCATE", "TABLE", "INDEX", "ORDER", "GROUP", "PRIMARY",
    "KEY", "NULL", "NOT", "AND", "OR",
];

/// Validate that an identifier is safe to interpolate into DDL
///
/// ```
/// use elif_migrate::security::validate_identifier;
///
/// assert!(validate_identifier("action_plans").is_ok());
/// assert!(validate_identifier("plans; DROP TABLE users").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> MigrationResult<()> {
    let first = identifier
        .chars()
        .next()
        .ok_or_else(|| MigrationError::InvalidIdentifier("identifier cannot be empty".to_string()))?;

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrationError::InvalidIdentifier(format!(
            "'{}' is too long (max {} characters)",
            identifier, MAX_IDENTIFIER_LEN
        )));
    }

    if let Some(c) = identifier.chars().find(|c| !ALLOWED_IDENTIFIER_CHARS.contains(*c)) {
        return Err(MigrationError::InvalidIdentifier(format!(
            "'{}' contains invalid character '{}'",
            identifier, c
        )));
    }

    if first.is_ascii_digit() {
        return Err(MigrationError::InvalidIdentifier(format!(
            "'{}' cannot start with a number",
            identifier
        )));
    }

    let upper = identifier.to_uppercase();
    if SQL_KEYWORDS.contains(&upper.as_str()) {
        return Err(MigrationError::InvalidIdentifier(format!(
            "'{}' is a reserved SQL keyword",
            identifier
        )));
    }

    Ok(())
}

/// Validate a list of identifiers, failing on the first bad one
pub fn validate_identifiers<'a, I>(identifiers: I) -> MigrationResult<()>
where
    I: IntoIterator<Item = &'a str>,
{
    identifiers.into_iter().try_for_each(validate_identifier)
}
