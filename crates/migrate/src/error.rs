//! Error types for the migration engine
//!
//! Every fallible operation returns [`MigrationResult`]. The runner wraps the
//! first failure of a run in [`MigrationError::MigrationFailed`] so callers can
//! see which version broke and how far the schema advanced.

use std::time::Duration;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The connected backend could not be classified into a known dialect
    #[error("Unsupported database dialect: {product}")]
    UnsupportedDialect { product: String },

    /// Two migrations were registered with the same version
    #[error("Duplicate migration version: {version}")]
    DuplicateVersion { version: i64 },

    /// A table, column or index referenced by a structural change does not exist
    #[error("Schema object not found: {kind} '{name}'")]
    SchemaObjectNotFound { kind: SchemaObjectKind, name: String },

    /// Persisting a single backfilled row failed
    #[error("Backfill of '{table}' failed at row {row_key}: {cause}")]
    BackfillRowError {
        table: String,
        row_key: String,
        cause: String,
    },

    /// Another runner holds the advisory lock
    #[error("Migration lock is held by '{holder}' since {locked_at}")]
    LockContention { holder: String, locked_at: String },

    /// The transaction wrapping a migration failed or could not be committed
    #[error("Transaction aborted: {reason}")]
    TransactionAbort { reason: String },

    /// A migration exceeded the configured timeout and was cancelled
    #[error("Migration {version} timed out after {after:?}")]
    Timeout { version: i64, after: Duration },

    /// Rollback was requested for a migration without `down` steps
    #[error("Migration {version} has no down steps and cannot be rolled back")]
    IrreversibleMigration { version: i64 },

    /// Identifier rejected before it reached generated SQL
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database driver or query error
    #[error("Database error: {0}")]
    Database(String),

    /// A migration failed during `apply_all` or a rollback
    #[error("Migration {version} ({label}) failed, last applied version: {}: {source}", display_version(.last_applied))]
    MigrationFailed {
        version: i64,
        label: String,
        last_applied: Option<i64>,
        #[source]
        source: Box<MigrationError>,
    },
}

/// Kind of schema object named in [`MigrationError::SchemaObjectNotFound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaObjectKind {
    Table,
    Column,
}

impl std::fmt::Display for SchemaObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaObjectKind::Table => write!(f, "table"),
            SchemaObjectKind::Column => write!(f, "column"),
        }
    }
}

/// Flat classification of [`MigrationError`], looking through `MigrationFailed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedDialect,
    DuplicateVersion,
    SchemaObjectNotFound,
    BackfillRowError,
    LockContention,
    TransactionAbort,
    Timeout,
    IrreversibleMigration,
    InvalidIdentifier,
    Configuration,
    Database,
}

impl MigrationError {
    /// Get the kind of the underlying failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::UnsupportedDialect { .. } => ErrorKind::UnsupportedDialect,
            MigrationError::DuplicateVersion { .. } => ErrorKind::DuplicateVersion,
            MigrationError::SchemaObjectNotFound { .. } => ErrorKind::SchemaObjectNotFound,
            MigrationError::BackfillRowError { .. } => ErrorKind::BackfillRowError,
            MigrationError::LockContention { .. } => ErrorKind::LockContention,
            MigrationError::TransactionAbort { .. } => ErrorKind::TransactionAbort,
            MigrationError::Timeout { .. } => ErrorKind::Timeout,
            MigrationError::IrreversibleMigration { .. } => ErrorKind::IrreversibleMigration,
            MigrationError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            MigrationError::Configuration(_) => ErrorKind::Configuration,
            MigrationError::Database(_) => ErrorKind::Database,
            MigrationError::MigrationFailed { source, .. } => source.kind(),
        }
    }

    /// Whether the caller may retry the whole run later (with backoff)
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::LockContention
    }

    /// Version of the migration that failed, if the error came from a run
    pub fn failed_version(&self) -> Option<i64> {
        match self {
            MigrationError::MigrationFailed { version, .. } => Some(*version),
            MigrationError::Timeout { version, .. } => Some(*version),
            _ => None,
        }
    }

    /// Last successfully applied version at the time of the failure
    pub fn last_applied(&self) -> Option<i64> {
        match self {
            MigrationError::MigrationFailed { last_applied, .. } => *last_applied,
            _ => None,
        }
    }
}

fn display_version(version: &Option<i64>) -> String {
    match version {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}
