//! SQL dialects and dialect resolution
//!
//! A [`Dialect`] is resolved once per runner invocation from the live
//! connection and then threaded through DDL generation, backfills and
//! bookkeeping. Migration authors branch on its capability queries instead of
//! comparing backend names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::backends::DatabaseConnection;
use crate::error::{MigrationError, MigrationResult};

/// Maximum index key size of InnoDB with the legacy (COMPACT/REDUNDANT) row formats
pub const MYSQL_MAX_INDEX_KEY_BYTES: u32 = 767;

/// Worst-case bytes per character under MySQL's default `utf8` collation
pub const MYSQL_BYTES_PER_CHAR: u32 = 3;

/// SQL dialect of a connected database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// ANSI SQL backend without known quirks
    Generic,
    /// MySQL and MariaDB
    MySqlFamily,
    PostgreSql,
    Sqlite,
}

impl Dialect {
    /// Short lowercase name, stable across releases
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Generic => "generic",
            Dialect::MySqlFamily => "mysql",
            Dialect::PostgreSql => "postgresql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Largest index key, in bytes, this dialect accepts on a single column
    ///
    /// `None` means the backend imposes no limit migrations need to care about.
    pub fn max_indexable_bytes(&self) -> Option<u32> {
        match self {
            Dialect::MySqlFamily => Some(MYSQL_MAX_INDEX_KEY_BYTES),
            Dialect::Generic | Dialect::PostgreSql | Dialect::Sqlite => None,
        }
    }

    /// Longest index prefix, in characters, that fits [`Self::max_indexable_bytes`]
    pub fn max_index_prefix_chars(&self) -> Option<u32> {
        self.max_indexable_bytes()
            .map(|bytes| bytes / MYSQL_BYTES_PER_CHAR)
    }

    /// Whether DDL statements can be rolled back inside a transaction
    ///
    /// MySQL commits implicitly before and after every DDL statement.
    pub fn supports_transactional_ddl(&self) -> bool {
        !matches!(self, Dialect::MySqlFamily)
    }

    /// Parameter placeholder for the zero-based bind index
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::PostgreSql => format!("${}", index + 1),
            Dialect::MySqlFamily | Dialect::Sqlite | Dialect::Generic => "?".to_string(),
        }
    }

    /// Whether `DROP INDEX` must name the table
    pub fn drop_index_needs_table(&self) -> bool {
        matches!(self, Dialect::MySqlFamily)
    }

    pub fn supports_boolean(&self) -> bool {
        !matches!(self, Dialect::MySqlFamily)
    }

    /// Classify a product name as reported by the server
    pub fn from_product_name(product: &str) -> MigrationResult<Self> {
        let lower = product.trim().to_lowercase();
        if lower.contains("mysql") || lower.contains("mariadb") {
            Ok(Dialect::MySqlFamily)
        } else if lower.contains("postgres") {
            Ok(Dialect::PostgreSql)
        } else if lower.contains("sqlite") {
            Ok(Dialect::Sqlite)
        } else if ["h2", "hsql", "derby", "ansi", "generic"]
            .iter()
            .any(|p| lower.starts_with(p))
        {
            Ok(Dialect::Generic)
        } else {
            Err(MigrationError::UnsupportedDialect {
                product: product.to_string(),
            })
        }
    }

    /// Classify a connection URL without connecting
    pub fn from_url(url: &str) -> MigrationResult<Self> {
        let normalized = url.trim().to_lowercase();
        let without_jdbc = normalized.strip_prefix("jdbc:").unwrap_or(&normalized);
        let scheme = without_jdbc.split(':').next().unwrap_or_default();

        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::PostgreSql),
            "mysql" | "mariadb" => Ok(Dialect::MySqlFamily),
            "sqlite" | "file" => Ok(Dialect::Sqlite),
            "h2" => Ok(Dialect::Generic),
            _ => Err(MigrationError::UnsupportedDialect {
                product: url.to_string(),
            }),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Dialect {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dialect::from_product_name(s)
    }
}

/// Resolves the [`Dialect`] of a live connection
pub struct DialectResolver;

impl DialectResolver {
    /// Inspect the server's product name and classify it
    pub async fn resolve(conn: &mut dyn DatabaseConnection) -> MigrationResult<Dialect> {
        let info = conn.server_info().await?;
        let dialect = Dialect::from_product_name(&info.product)?;

        tracing::debug!(
            "Resolved dialect {} from {} {}",
            dialect,
            info.product,
            info.version.as_deref().unwrap_or("(unknown version)")
        );
        Ok(dialect)
    }
}
