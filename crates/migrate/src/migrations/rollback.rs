//! Migration Rollback - Handles rolling back applied migrations
//!
//! Reverts applied migrations newest first by running their `down` steps and
//! deleting their bookkeeping records, under the same lock and isolation
//! rules as [`MigrationRunner::apply_all`].

use std::time::Instant;

use super::definitions::{Migration, RollbackResult, RunnerState, SchemaState};
use super::lock::MigrationLock;
use super::runner::{transition, MigrationDirection, MigrationRunner};
use crate::backends::DatabaseConnection;
use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult};

impl MigrationRunner {
    /// Roll back the most recently applied migration
    pub async fn rollback_last(&mut self, conn: &mut dyn DatabaseConnection) -> MigrationResult<RollbackResult> {
        self.rollback(conn, RollbackTarget::Last).await
    }

    /// Roll back every applied migration newer than `target`
    ///
    /// `None` reverts everything. Fails with
    /// [`MigrationError::IrreversibleMigration`] before touching the database
    /// if any migration in the range has no `down` steps.
    pub async fn rollback_to(
        &mut self,
        conn: &mut dyn DatabaseConnection,
        target: Option<i64>,
    ) -> MigrationResult<RollbackResult> {
        self.rollback(conn, RollbackTarget::Version(target)).await
    }

    async fn rollback(
        &mut self,
        conn: &mut dyn DatabaseConnection,
        target: RollbackTarget,
    ) -> MigrationResult<RollbackResult> {
        let start_time = Instant::now();
        self.config().validate()?;

        transition(self.state_mut(), RunnerState::Resolving);
        let dialect = match self.prepare_rollback(conn).await {
            Ok(dialect) => dialect,
            Err(e) => {
                transition(self.state_mut(), RunnerState::Failed { version: None });
                return Err(e);
            }
        };

        let outcome = self.rollback_locked(conn, dialect, target, start_time).await;
        let released = MigrationLock::new(self.config(), dialect).release(conn).await;

        match (outcome, released) {
            (Ok(result), Ok(())) => {
                transition(self.state_mut(), RunnerState::Done);
                Ok(result)
            }
            (Ok(result), Err(e)) => {
                tracing::error!("Failed to release migration lock after a successful rollback: {}", e);
                transition(self.state_mut(), RunnerState::Done);
                Ok(result)
            }
            (Err(e), released) => {
                if let Err(release_err) = released {
                    tracing::warn!("Failed to release migration lock after error: {}", release_err);
                }
                Err(e)
            }
        }
    }

    /// Resolve the dialect, create the tables and take the lock
    async fn prepare_rollback(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<Dialect> {
        let dialect = self.resolve_dialect(conn).await?;
        self.ensure_migrations_table(conn).await?;
        let lock = MigrationLock::new(self.config(), dialect);
        lock.ensure_table(conn).await?;
        lock.acquire(conn).await?;
        Ok(dialect)
    }

    async fn rollback_locked(
        &mut self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
        target: RollbackTarget,
        start_time: Instant,
    ) -> MigrationResult<RollbackResult> {
        transition(self.state_mut(), RunnerState::Scanning);
        let records = match self.applied_records(conn).await {
            Ok(records) => records,
            Err(e) => {
                transition(self.state_mut(), RunnerState::Failed { version: None });
                return Err(e);
            }
        };
        let mut schema_state = SchemaState::from_records(&records);

        let versions: Vec<i64> = match target {
            RollbackTarget::Last => schema_state.current_version().into_iter().collect(),
            RollbackTarget::Version(target) => schema_state
                .versions()
                .iter()
                .rev()
                .copied()
                .filter(|v| target.map_or(true, |t| *v > t))
                .collect(),
        };

        let migrations = match self.revertible(&versions) {
            Ok(migrations) => migrations,
            Err(e) => {
                transition(self.state_mut(), RunnerState::Failed { version: None });
                return Err(e);
            }
        };
        if migrations.is_empty() {
            tracing::info!("Nothing to roll back");
        }

        let mut rolled_back = Vec::with_capacity(migrations.len());
        for migration in migrations {
            tracing::info!("Rolling back migration: {} - {}", migration.version, migration.label);
            if let Err(e) = self
                .execute_migration(conn, dialect, &migration, MigrationDirection::Down)
                .await
            {
                tracing::error!("Rollback of migration {} failed: {}", migration.version, e);
                transition(
                    self.state_mut(),
                    RunnerState::Failed {
                        version: Some(migration.version),
                    },
                );
                return Err(MigrationError::MigrationFailed {
                    version: migration.version,
                    label: migration.label.clone(),
                    last_applied: schema_state.current_version(),
                    source: Box::new(e),
                });
            }
            schema_state.remove(migration.version);
            rolled_back.push(migration.version);
        }

        Ok(RollbackResult {
            rolled_back,
            final_state: schema_state,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    /// Registered migrations for `versions`, all of which must have `down` steps
    fn revertible(&self, versions: &[i64]) -> MigrationResult<Vec<Migration>> {
        versions
            .iter()
            .map(|&version| {
                let migration = self.registry().get(version).ok_or_else(|| {
                    MigrationError::Configuration(format!(
                        "Applied migration {} is not registered",
                        version
                    ))
                })?;
                if migration.down.is_none() {
                    return Err(MigrationError::IrreversibleMigration { version });
                }
                Ok(migration.clone())
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum RollbackTarget {
    Last,
    Version(Option<i64>),
}
