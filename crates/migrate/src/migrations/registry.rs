//! Migration Registry - the ordered set of known migrations

use std::collections::{BTreeMap, BTreeSet};

use super::definitions::Migration;
use crate::error::{MigrationError, MigrationResult};

/// Registered migrations keyed by version
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<i64, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration; versions must be unique
    pub fn register(&mut self, migration: Migration) -> MigrationResult<()> {
        if self.migrations.contains_key(&migration.version) {
            return Err(MigrationError::DuplicateVersion {
                version: migration.version,
            });
        }
        self.migrations.insert(migration.version, migration);
        Ok(())
    }

    /// Register several migrations, stopping at the first duplicate
    pub fn register_all<I>(&mut self, migrations: I) -> MigrationResult<()>
    where
        I: IntoIterator<Item = Migration>,
    {
        migrations.into_iter().try_for_each(|m| self.register(m))
    }

    /// Migrations not in `applied`, ascending by version
    pub fn pending(&self, applied: &BTreeSet<i64>) -> Vec<&Migration> {
        self.migrations
            .values()
            .filter(|m| !applied.contains(&m.version))
            .collect()
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    /// Newest registered version
    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.keys().next_back().copied()
    }

    /// All migrations, ascending
    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
