//! Migration engine configuration
//!
//! Defaults suit most deployments; every field can be overridden from the
//! environment with [`MigrationConfig::from_env`].

use std::env;
use std::time::Duration;

use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult};
use crate::security::validate_identifier;

pub const ENV_MIGRATIONS_TABLE: &str = "ELIF_MIGRATIONS_TABLE";
pub const ENV_LOCK_TABLE: &str = "ELIF_MIGRATIONS_LOCK_TABLE";
pub const ENV_LOCK_OWNER: &str = "ELIF_MIGRATIONS_LOCK_OWNER";
pub const ENV_STALE_LOCK_SECS: &str = "ELIF_MIGRATIONS_STALE_LOCK_SECS";
pub const ENV_TIMEOUT_SECS: &str = "ELIF_MIGRATIONS_TIMEOUT_SECS";
pub const ENV_DIALECT: &str = "ELIF_MIGRATIONS_DIALECT";

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Table name for tracking applied migrations
    pub migrations_table: String,
    /// Table holding the advisory lock row
    pub lock_table: String,
    /// Identifies this runner in the lock row
    pub lock_owner: String,
    /// Take over a lock older than this; `None` never steals a lock
    pub stale_lock_after: Option<Duration>,
    /// Upper bound for a single migration; `None` waits indefinitely
    pub migration_timeout: Option<Duration>,
    /// Skip dialect resolution and use this dialect
    pub dialect_override: Option<Dialect>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_table: "elif_migrations".to_string(),
            lock_table: "elif_migrations_lock".to_string(),
            lock_owner: format!("runner-{}", uuid::Uuid::new_v4()),
            stale_lock_after: None,
            migration_timeout: None,
            dialect_override: None,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> MigrationResult<Self> {
        let mut config = Self::default();

        if let Some(table) = env_var(ENV_MIGRATIONS_TABLE) {
            config.migrations_table = table;
        }
        if let Some(table) = env_var(ENV_LOCK_TABLE) {
            config.lock_table = table;
        }
        if let Some(owner) = env_var(ENV_LOCK_OWNER) {
            config.lock_owner = owner;
        }
        if let Some(secs) = env_var(ENV_STALE_LOCK_SECS) {
            config.stale_lock_after = Some(parse_secs(ENV_STALE_LOCK_SECS, &secs)?);
        }
        if let Some(secs) = env_var(ENV_TIMEOUT_SECS) {
            config.migration_timeout = Some(parse_secs(ENV_TIMEOUT_SECS, &secs)?);
        }
        if let Some(dialect) = env_var(ENV_DIALECT) {
            config.dialect_override = Some(dialect.parse().map_err(|_| {
                MigrationError::Configuration(format!(
                    "{} must be one of mysql, postgresql, sqlite, generic (got '{}')",
                    ENV_DIALECT, dialect
                ))
            })?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_stale_lock_after(mut self, after: Duration) -> Self {
        self.stale_lock_after = Some(after);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = Some(timeout);
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect_override = Some(dialect);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> MigrationResult<()> {
        validate_identifier(&self.migrations_table)
            .and_then(|_| validate_identifier(&self.lock_table))
            .map_err(|e| MigrationError::Configuration(e.to_string()))?;

        if self.migrations_table.eq_ignore_ascii_case(&self.lock_table) {
            return Err(MigrationError::Configuration(
                "migrations table and lock table must differ".to_string(),
            ));
        }
        if self.lock_owner.trim().is_empty() || self.lock_owner.len() > 64 {
            return Err(MigrationError::Configuration(
                "lock owner must be between 1 and 64 characters".to_string(),
            ));
        }
        if self.migration_timeout == Some(Duration::ZERO) {
            return Err(MigrationError::Configuration(
                "migration timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_secs(name: &str, value: &str) -> MigrationResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| {
            MigrationError::Configuration(format!(
                "{} must be a whole number of seconds (got '{}')",
                name, value
            ))
        })
}
