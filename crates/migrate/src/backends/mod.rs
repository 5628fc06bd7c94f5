//! Database Backend Abstractions
//!
//! The engine talks to the database only through [`DatabaseConnection`].
//! [`SqlxConnection`] is the production implementation; tests and embedding
//! applications may provide their own.

pub mod any;
pub mod core;

pub use self::any::SqlxConnection;
pub use self::core::*;
