//! Core Database Capability Traits
//!
//! The migration engine never owns a pool. Callers hand it a single
//! [`DatabaseConnection`], and everything the engine does (dialect resolution,
//! DDL execution, backfills, bookkeeping) goes through this trait.

use async_trait::async_trait;
use std::fmt;

use crate::error::{MigrationError, MigrationResult};

/// Abstract database connection used by the migration engine
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Execute a statement and return the affected rows count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64>;

    /// Execute a query and return all result rows
    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<DatabaseRow>>;

    /// Begin a transaction on this connection
    async fn begin(&mut self) -> MigrationResult<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> MigrationResult<()>;

    /// Roll back the current transaction
    async fn rollback(&mut self) -> MigrationResult<()>;

    /// Product name and version reported by the server
    async fn server_info(&mut self) -> MigrationResult<ServerInfo>;

    /// Execute a query and return the first row, if any
    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Option<DatabaseRow>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }
}

/// Product information read from a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Product name, e.g. "PostgreSQL", "MySQL", "MariaDB", "SQLite"
    pub product: String,
    /// Server version string, when the backend reports one
    pub version: Option<String>,
}

impl ServerInfo {
    pub fn new(product: impl Into<String>, version: Option<String>) -> Self {
        Self {
            product: product.into(),
            version,
        }
    }
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Null or an empty/whitespace-only string
    pub fn is_blank(&self) -> bool {
        match self {
            DatabaseValue::Null => true,
            DatabaseValue::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseValue::Null => write!(f, "NULL"),
            DatabaseValue::Bool(b) => write!(f, "{}", b),
            DatabaseValue::Int32(i) => write!(f, "{}", i),
            DatabaseValue::Int64(i) => write!(f, "{}", i),
            DatabaseValue::Float64(v) => write!(f, "{}", v),
            DatabaseValue::String(s) => write!(f, "{}", s),
            DatabaseValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::String(value.hyphenated().to_string())
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// A fetched row: column names paired with their values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseRow {
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl DatabaseRow {
    pub fn new(columns: Vec<String>, values: Vec<DatabaseValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get a column value by name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }

    /// Get a column value by index
    pub fn get_by_index(&self, index: usize) -> Option<&DatabaseValue> {
        self.values.get(index)
    }

    /// Get a required column value, failing with a database error when missing
    pub fn require(&self, name: &str) -> MigrationResult<&DatabaseValue> {
        self.get(name)
            .ok_or_else(|| MigrationError::Database(format!("column '{}' missing from result row", name)))
    }

    pub fn try_get_i64(&self, name: &str) -> MigrationResult<Option<i64>> {
        match self.require(name)? {
            DatabaseValue::Null => Ok(None),
            value => value.as_i64().map(Some).ok_or_else(|| {
                MigrationError::Database(format!("column '{}' is not an integer: {}", name, value))
            }),
        }
    }

    pub fn try_get_string(&self, name: &str) -> MigrationResult<Option<String>> {
        match self.require(name)? {
            DatabaseValue::Null => Ok(None),
            DatabaseValue::String(s) => Ok(Some(s.clone())),
            value => Ok(Some(value.to_string())),
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = DatabaseRow::new(
            vec!["ID".to_string(), "kee".to_string()],
            vec![DatabaseValue::Int64(4), DatabaseValue::Null],
        );

        assert_eq!(row.get("id"), Some(&DatabaseValue::Int64(4)));
        assert_eq!(row.try_get_i64("id").unwrap(), Some(4));
        assert_eq!(row.try_get_string("KEE").unwrap(), None);
        assert!(row.get("missing").is_none());
        assert!(row.require("missing").is_err());
    }

    #[test]
    fn test_blank_values() {
        assert!(DatabaseValue::Null.is_blank());
        assert!(DatabaseValue::from("  ").is_blank());
        assert!(!DatabaseValue::from("abc").is_blank());
        assert!(!DatabaseValue::Int64(0).is_blank());
        assert_eq!(DatabaseValue::from(None::<i64>), DatabaseValue::Null);
    }
}
