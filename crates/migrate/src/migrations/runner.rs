//! Migration Runner - Executes migrations against the database
//!
//! Resolves the dialect, takes the advisory lock, reads the bookkeeping table
//! and applies every pending migration in ascending version order. Each
//! migration is applied under its isolation mode and recorded only once all
//! of its steps succeeded.

use chrono::{DateTime, Utc};
use std::time::Instant;

use super::backfill::BackfillExecutor;
use super::catalog::{SchemaInspector, StaticCatalog};
use super::definitions::{
    DatabaseStatus, Isolation, Migration, MigrationOutcome, MigrationRecord, MigrationRunResult,
    MigrationStatus, MigrationStep, PlannedMigration, RunnerState, SchemaState,
};
use super::lock::MigrationLock;
use super::registry::MigrationRegistry;
use super::schema_builder::DdlBuilder;
use crate::backends::{DatabaseConnection, DatabaseValue};
use crate::config::MigrationConfig;
use crate::dialect::{Dialect, DialectResolver};
use crate::error::{ErrorKind, MigrationError, MigrationResult};

/// Longest label stored in the bookkeeping table
const MAX_LABEL_LEN: usize = 255;

/// Direction a migration's steps are executed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Up,
    Down,
}

/// Counters collected while executing steps
#[derive(Debug, Default)]
pub(crate) struct StepStats {
    pub statements: usize,
    pub rows_backfilled: u64,
}

/// Migration runner that executes migrations against a database
pub struct MigrationRunner {
    registry: MigrationRegistry,
    config: MigrationConfig,
    state: RunnerState,
}

impl MigrationRunner {
    /// Create a runner with the default configuration
    pub fn new(registry: MigrationRegistry) -> Self {
        Self::with_config(registry, MigrationConfig::default())
    }

    pub fn with_config(registry: MigrationRegistry, config: MigrationConfig) -> Self {
        Self {
            registry,
            config,
            state: RunnerState::Idle,
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// State reached by the last run
    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut RunnerState {
        &mut self.state
    }

    /// Apply every pending migration, ascending by version
    ///
    /// Stops at the first failing migration and returns
    /// [`MigrationError::MigrationFailed`] carrying the failed version and the
    /// last version that was applied. Migrations after the failing one are
    /// not attempted. The lock is released on every exit path.
    pub async fn apply_all(&mut self, conn: &mut dyn DatabaseConnection) -> MigrationResult<MigrationRunResult> {
        let start_time = Instant::now();
        self.config.validate()?;

        transition(&mut self.state, RunnerState::Resolving);
        let dialect = match self.prepare(conn).await {
            Ok(dialect) => dialect,
            Err(e) => {
                transition(&mut self.state, RunnerState::Failed { version: None });
                return Err(e);
            }
        };

        let lock = MigrationLock::new(&self.config, dialect);
        if let Err(e) = lock.acquire(conn).await {
            transition(&mut self.state, RunnerState::Failed { version: None });
            return Err(e);
        }

        let outcome = self.apply_locked(conn, dialect, start_time).await;
        let released = MigrationLock::new(&self.config, dialect).release(conn).await;

        match (outcome, released) {
            (Ok(result), Ok(())) => {
                transition(&mut self.state, RunnerState::Done);
                Ok(result)
            }
            (Ok(result), Err(e)) => {
                // The migrations are committed; a stuck lock row is left for stale takeover
                tracing::error!("Failed to release migration lock after a successful run: {}", e);
                transition(&mut self.state, RunnerState::Done);
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

    async fn apply_locked(
        &mut self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
        start_time: Instant,
    ) -> MigrationResult<MigrationRunResult> {
        transition(&mut self.state, RunnerState::Scanning);
        let records = match self.applied_records(conn).await {
            Ok(records) => records,
            Err(e) => {
                transition(&mut self.state, RunnerState::Failed { version: None });
                return Err(e);
            }
        };
        let mut schema_state = SchemaState::from_records(&records);

        let pending = self.registry.pending(schema_state.versions());
        let skipped_count = self.registry.len() - pending.len();

        if pending.is_empty() {
            tracing::info!(
                "Database schema is up to date at version {}",
                schema_state
                    .current_version()
                    .map_or_else(|| "none".to_string(), |v| v.to_string())
            );
        } else {
            tracing::info!("{} pending migration(s) on {}", pending.len(), dialect);
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for migration in pending {
            transition(
                &mut self.state,
                RunnerState::Applying {
                    version: migration.version,
                },
            );
            tracing::info!("Applying migration: {} - {}", migration.version, migration.label);

            match self
                .execute_migration(conn, dialect, migration, MigrationDirection::Up)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(
                        "Applied migration {} in {}ms",
                        migration.version,
                        outcome.execution_time_ms
                    );
                    schema_state.insert(migration.version);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    tracing::error!("Migration {} failed: {}", migration.version, e);
                    transition(
                        &mut self.state,
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
            }
        }

        Ok(MigrationRunResult {
            dialect,
            applied: outcomes.iter().map(|o| o.version).collect(),
            outcomes,
            skipped_count,
            final_state: schema_state,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    /// Compare the database version with the newest registered migration
    ///
    /// A registered version missing below the database version still
    /// reports [`DatabaseStatus::RequiresUpgrade`].
    pub async fn status(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<DatabaseStatus> {
        let dialect = self.resolve_dialect(conn).await?;
        let records = self.existing_records(conn, dialect).await?;
        let state = SchemaState::from_records(&records);
        let has_pending = !self.registry.pending(state.versions()).is_empty();
        Ok(DatabaseStatus::evaluate(
            state.current_version(),
            self.registry.latest_version(),
            has_pending,
        ))
    }

    /// Status of every registered migration, ascending
    pub async fn migration_status(
        &self,
        conn: &mut dyn DatabaseConnection,
    ) -> MigrationResult<Vec<(&Migration, MigrationStatus)>> {
        let dialect = self.resolve_dialect(conn).await?;
        let records = self.existing_records(conn, dialect).await?;

        Ok(self
            .registry
            .iter()
            .map(|migration| {
                let status = records
                    .iter()
                    .find(|r| r.version == migration.version)
                    .map_or(MigrationStatus::Pending, |r| MigrationStatus::Applied {
                        applied_at: r.applied_at,
                    });
                (migration, status)
            })
            .collect())
    }

    /// Render what `apply_all` would execute, without changing the database
    ///
    /// Earlier pending migrations are reflected in an in-memory catalog, so a
    /// table created by one migration can be altered by a later one.
    pub async fn plan(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<Vec<PlannedMigration>> {
        let dialect = self.resolve_dialect(conn).await?;
        let records = self.existing_records(conn, dialect).await?;
        let state = SchemaState::from_records(&records);

        let builder = DdlBuilder::new(dialect);
        let inspector = SchemaInspector::new(dialect);
        let mut catalog = StaticCatalog::new();
        let mut inspected = std::collections::HashSet::new();
        let mut planned = Vec::new();

        for migration in self.registry.pending(state.versions()) {
            let mut statements = Vec::new();
            for step in &migration.up {
                match step {
                    MigrationStep::Change(change) => {
                        let table = change.table().to_lowercase();
                        if !catalog.contains(&table) && inspected.insert(table) {
                            if let Some(schema) = inspector.describe_table(conn, change.table()).await? {
                                catalog.insert(schema);
                            }
                        }
                        statements.extend(builder.build(change, &catalog)?);
                        catalog.apply(change);
                    }
                    MigrationStep::Backfill(job) => statements.push(format!(
                        "-- backfill {} in batches of {}",
                        job.table, job.batch_size
                    )),
                    MigrationStep::Raw(raw) => match raw.for_dialect(dialect) {
                        Some(sql) => statements.push(sql.to_string()),
                        None => statements.push(format!("-- raw statement skipped on {}", dialect)),
                    },
                }
            }

            planned.push(PlannedMigration {
                version: migration.version,
                label: migration.label.clone(),
                isolation: migration.effective_isolation(dialect),
                statements,
            });
        }

        Ok(planned)
    }

    /// Resolve the dialect and create the bookkeeping and lock tables
    async fn prepare(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<Dialect> {
        let dialect = self.resolve_dialect(conn).await?;
        tracing::debug!("Resolved dialect: {}", dialect);
        self.ensure_migrations_table(conn).await?;
        MigrationLock::new(&self.config, dialect).ensure_table(conn).await?;
        Ok(dialect)
    }

    pub(crate) async fn resolve_dialect(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<Dialect> {
        match self.config.dialect_override {
            Some(dialect) => Ok(dialect),
            None => DialectResolver::resolve(conn).await,
        }
    }

    pub(crate) async fn ensure_migrations_table(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version BIGINT NOT NULL PRIMARY KEY,\n    \
                label VARCHAR({}) NOT NULL,\n    \
                applied_at VARCHAR(40) NOT NULL\n\
            )",
            self.config.migrations_table, MAX_LABEL_LEN
        );
        conn.execute(&sql, &[]).await.map_err(|e| {
            MigrationError::Database(format!("Failed to create migrations table: {}", e))
        })?;
        Ok(())
    }

    /// Records of applied migrations, ascending by version
    pub(crate) async fn applied_records(
        &self,
        conn: &mut dyn DatabaseConnection,
    ) -> MigrationResult<Vec<MigrationRecord>> {
        let sql = format!(
            "SELECT version, label, applied_at FROM {} ORDER BY version",
            self.config.migrations_table
        );
        let rows = conn.fetch_all(&sql, &[]).await?;

        rows.iter()
            .map(|row| {
                let version = row.try_get_i64("version")?.ok_or_else(|| {
                    MigrationError::Database("Migration record without version".to_string())
                })?;
                let applied_at = row.try_get_string("applied_at")?.unwrap_or_default();
                let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|e| {
                        MigrationError::Database(format!(
                            "Migration {} has an unreadable applied_at '{}': {}",
                            version, applied_at, e
                        ))
                    })?;
                Ok(MigrationRecord {
                    version,
                    label: row.try_get_string("label")?.unwrap_or_default(),
                    applied_at,
                })
            })
            .collect()
    }

    /// Like `applied_records`, but treats a missing bookkeeping table as empty
    async fn existing_records(
        &self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
    ) -> MigrationResult<Vec<MigrationRecord>> {
        let exists = SchemaInspector::new(dialect)
            .describe_table(conn, &self.config.migrations_table)
            .await?
            .is_some();
        if !exists {
            return Ok(Vec::new());
        }
        self.applied_records(conn).await
    }

    /// Run one migration in `direction` under its isolation mode
    ///
    /// Up writes the bookkeeping record after the steps; Down deletes it.
    /// Under `Transactional` both happen in the same transaction. With a
    /// configured timeout, an overrun is rolled back when a transaction is
    /// open and reported as [`MigrationError::Timeout`].
    pub(crate) async fn execute_migration(
        &self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
        migration: &Migration,
        direction: MigrationDirection,
    ) -> MigrationResult<MigrationOutcome> {
        let start_time = Instant::now();
        let isolation = migration.effective_isolation(dialect);
        let steps: &[MigrationStep] = match direction {
            MigrationDirection::Up => &migration.up,
            MigrationDirection::Down => migration
                .down
                .as_deref()
                .ok_or(MigrationError::IrreversibleMigration {
                    version: migration.version,
                })?,
        };

        match isolation {
            Isolation::Transactional => {
                if !dialect.supports_transactional_ddl() && has_structural_change(steps) {
                    tracing::warn!(
                        "Migration {} runs DDL in a transaction on {}; DDL commits implicitly and will not roll back",
                        migration.version,
                        dialect
                    );
                }
                conn.begin().await.map_err(|e| MigrationError::TransactionAbort {
                    reason: format!("Failed to start transaction: {}", e),
                })?;
            }
            Isolation::NonTransactional => {
                tracing::warn!(
                    "Migration {} runs without a transaction; a failure leaves completed statements in place",
                    migration.version
                );
            }
        }

        let work = async {
            let stats = self.execute_steps(&mut *conn, dialect, steps).await?;
            match direction {
                MigrationDirection::Up => self.record_applied(&mut *conn, dialect, migration).await?,
                MigrationDirection::Down => self.remove_record(&mut *conn, dialect, migration.version).await?,
            }
            Ok::<_, MigrationError>(stats)
        };

        let result = match self.config.migration_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(MigrationError::Timeout {
                    version: migration.version,
                    after: limit,
                }),
            },
            None => work.await,
        };

        let stats = match (result, isolation) {
            (Ok(stats), Isolation::Transactional) => {
                conn.commit().await.map_err(|e| MigrationError::TransactionAbort {
                    reason: format!("Failed to commit migration {}: {}", migration.version, e),
                })?;
                stats
            }
            (Ok(stats), Isolation::NonTransactional) => stats,
            (Err(e), Isolation::Transactional) => {
                if let Err(rollback_err) = conn.rollback().await {
                    tracing::error!(
                        "Failed to roll back migration {}: {}",
                        migration.version,
                        rollback_err
                    );
                }
                return Err(match e.kind() {
                    ErrorKind::Database => MigrationError::TransactionAbort {
                        reason: e.to_string(),
                    },
                    _ => e,
                });
            }
            (Err(e), Isolation::NonTransactional) => {
                tracing::warn!(
                    "Migration {} stopped part way; completed statements were not reverted",
                    migration.version
                );
                return Err(e);
            }
        };

        Ok(MigrationOutcome {
            version: migration.version,
            label: migration.label.clone(),
            isolation,
            statements: stats.statements,
            rows_backfilled: stats.rows_backfilled,
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }

    async fn execute_steps(
        &self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
        steps: &[MigrationStep],
    ) -> MigrationResult<StepStats> {
        let builder = DdlBuilder::new(dialect);
        let inspector = SchemaInspector::new(dialect);
        let backfill = BackfillExecutor::new(dialect);
        let mut stats = StepStats::default();

        for step in steps {
            match step {
                MigrationStep::Change(change) => {
                    let catalog = inspector.load(conn, [change.table()]).await?;
                    for sql in builder.build(change, &catalog)? {
                        tracing::debug!("{}", sql);
                        conn.execute(&sql, &[]).await.map_err(|e| {
                            MigrationError::Database(format!("Failed to execute `{}`: {}", sql, e))
                        })?;
                        stats.statements += 1;
                    }
                }
                MigrationStep::Backfill(job) => {
                    stats.rows_backfilled += backfill.run(job, conn).await?;
                }
                MigrationStep::Raw(raw) => match raw.for_dialect(dialect) {
                    Some(sql) => {
                        tracing::debug!("{}", sql);
                        conn.execute(sql, &[]).await.map_err(|e| {
                            MigrationError::Database(format!("Failed to execute `{}`: {}", sql, e))
                        })?;
                        stats.statements += 1;
                    }
                    None => tracing::debug!("Skipping raw statement with no variant for {}", dialect),
                },
            }
        }

        Ok(stats)
    }

    async fn record_applied(
        &self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
        migration: &Migration,
    ) -> MigrationResult<()> {
        let sql = format!(
            "INSERT INTO {} (version, label, applied_at) VALUES ({}, {}, {})",
            self.config.migrations_table,
            dialect.placeholder(0),
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let label: String = migration.label.chars().take(MAX_LABEL_LEN).collect();
        conn.execute(
            &sql,
            &[
                DatabaseValue::Int64(migration.version),
                label.into(),
                Utc::now().to_rfc3339().into(),
            ],
        )
        .await
        .map_err(|e| MigrationError::Database(format!("Failed to record migration: {}", e)))?;
        Ok(())
    }

    async fn remove_record(
        &self,
        conn: &mut dyn DatabaseConnection,
        dialect: Dialect,
        version: i64,
    ) -> MigrationResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE version = {}",
            self.config.migrations_table,
            dialect.placeholder(0)
        );
        conn.execute(&sql, &[DatabaseValue::Int64(version)])
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to remove migration record: {}", e)))?;
        Ok(())
    }
}

pub(crate) fn transition(state: &mut RunnerState, next: RunnerState) {
    tracing::debug!("Migration runner: {:?} -> {:?}", state, next);
    *state = next;
}

fn has_structural_change(steps: &[MigrationStep]) -> bool {
    steps.iter().any(|s| matches!(s, MigrationStep::Change(_)))
}
