//! # elif-migrate: Schema migrations for elif.rs
//!
//! Versioned schema migrations that run against PostgreSQL, MySQL/MariaDB,
//! SQLite and generic ANSI backends: dialect resolution, dialect-aware DDL,
//! batched row backfills and a locked, resumable runner.
//!
//! ```no_run
//! use elif_migrate::{ColumnDef, IndexDef, Migration, MigrationRegistry, MigrationRunner, SqlxConnection};
//!
//! # async fn run() -> elif_migrate::MigrationResult<()> {
//! let mut registry = MigrationRegistry::new();
//! registry.register(
//!     Migration::new(62, "add project kee index")
//!         .add_column("projects", ColumnDef::string("kee").limit(400))
//!         .add_index(IndexDef::new("projects", &["kee"])),
//! )?;
//!
//! let mut conn = SqlxConnection::connect("sqlite://app.db").await?;
//! let result = MigrationRunner::new(registry).apply_all(&mut conn).await?;
//! println!("applied {:?}", result.applied);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod dialect;
pub mod error;
pub mod migrations;
pub mod security;

// Re-export core types
pub use backends::{DatabaseConnection, DatabaseRow, DatabaseValue, ServerInfo, SqlxConnection};
pub use config::*;
pub use dialect::*;
pub use error::*;
pub use migrations::*;
pub use security::*;
