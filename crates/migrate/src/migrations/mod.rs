//! Migration System
//!
//! Authoring types, the registry of known migrations, DDL generation,
//! row backfills and the runner that applies them.

pub mod backfill;
pub mod catalog;
pub mod definitions;
pub mod lock;
pub mod registry;
pub mod rollback;
pub mod runner;
pub mod schema_builder;

pub use backfill::*;
pub use catalog::*;
pub use definitions::*;
pub use lock::*;
pub use registry::*;
pub use runner::*;
pub use schema_builder::*;
