//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the authoring vocabulary ([`Migration`], [`MigrationStep`],
//! [`RawStatement`]) and the records and results exchanged with the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::backfill::{BackfillJob, RowUpdate};
use super::schema_builder::{ColumnDef, IndexDef, StructuralChange, TableBuilder};
use crate::backends::DatabaseRow;
use crate::dialect::Dialect;

/// SQL escape hatch with per-dialect variants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStatement {
    variants: HashMap<Dialect, String>,
    fallback: Option<String>,
}

impl RawStatement {
    /// Same SQL on every dialect
    pub fn any(sql: impl Into<String>) -> Self {
        Self {
            variants: HashMap::new(),
            fallback: Some(sql.into()),
        }
    }

    /// SQL for one dialect only; other dialects skip the statement
    pub fn only(dialect: Dialect, sql: impl Into<String>) -> Self {
        Self::default().on(dialect, sql)
    }

    pub fn on(mut self, dialect: Dialect, sql: impl Into<String>) -> Self {
        self.variants.insert(dialect, sql.into());
        self
    }

    pub fn otherwise(mut self, sql: impl Into<String>) -> Self {
        self.fallback = Some(sql.into());
        self
    }

    /// SQL to run on `dialect`, if any
    pub fn for_dialect(&self, dialect: Dialect) -> Option<&str> {
        self.variants
            .get(&dialect)
            .or(self.fallback.as_ref())
            .map(String::as_str)
    }
}

/// One unit of work inside a migration's `up` or `down`
#[derive(Debug, Clone)]
pub enum MigrationStep {
    Change(StructuralChange),
    Backfill(BackfillJob),
    Raw(RawStatement),
}

impl MigrationStep {
    pub fn describe(&self) -> String {
        match self {
            MigrationStep::Change(change) => change.describe(),
            MigrationStep::Backfill(job) => format!("backfill {}", job.table),
            MigrationStep::Raw(_) => "raw statement".to_string(),
        }
    }
}

/// How a migration's steps are wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    /// One transaction for all steps and the bookkeeping record
    Transactional,
    /// Each statement commits on its own; the record is written last
    NonTransactional,
}

impl Isolation {
    /// Default isolation for a dialect
    pub fn default_for(dialect: Dialect) -> Self {
        if dialect.supports_transactional_ddl() {
            Isolation::Transactional
        } else {
            Isolation::NonTransactional
        }
    }
}

/// Represents a database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique, ascending-orderable version
    pub version: i64,
    /// Human-readable name for the migration
    pub label: String,
    pub up: Vec<MigrationStep>,
    pub down: Option<Vec<MigrationStep>>,
    /// Forced isolation; `None` follows the dialect default
    pub isolation: Option<Isolation>,
}

impl Migration {
    pub fn new(version: i64, label: impl Into<String>) -> Self {
        Self {
            version,
            label: label.into(),
            up: Vec::new(),
            down: None,
            isolation: None,
        }
    }

    pub fn step(mut self, step: MigrationStep) -> Self {
        self.up.push(step);
        self
    }

    pub fn change(self, change: StructuralChange) -> Self {
        self.step(MigrationStep::Change(change))
    }

    pub fn create_table<F>(self, table: &str, callback: F) -> Self
    where
        F: FnOnce(&mut TableBuilder),
    {
        let mut builder = TableBuilder::new(table);
        callback(&mut builder);
        self.change(builder.into_change())
    }

    pub fn add_column(self, table: &str, column: ColumnDef) -> Self {
        self.change(StructuralChange::AddColumn {
            table: table.to_string(),
            column,
        })
    }

    pub fn add_index(self, index: IndexDef) -> Self {
        self.change(StructuralChange::AddIndex(index))
    }

    pub fn backfill(self, job: BackfillJob) -> Self {
        self.step(MigrationStep::Backfill(job))
    }

    /// Shorthand for `backfill(BackfillJob::new(..))`
    pub fn run_backfill<F>(self, table: &str, batch_size: usize, transform: F) -> Self
    where
        F: Fn(&DatabaseRow) -> Option<RowUpdate> + Send + Sync + 'static,
    {
        self.backfill(BackfillJob::new(table, batch_size, transform))
    }

    pub fn raw(self, statement: RawStatement) -> Self {
        self.step(MigrationStep::Raw(statement))
    }

    /// Set the steps that revert this migration
    pub fn down(mut self, steps: Vec<MigrationStep>) -> Self {
        self.down = Some(steps);
        self
    }

    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Isolation used on `dialect`
    pub fn effective_isolation(&self, dialect: Dialect) -> Isolation {
        self.isolation.unwrap_or_else(|| Isolation::default_for(dialect))
    }
}

/// Bookkeeping row for an applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub label: String,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
}

/// Applied versions, as read from the bookkeeping table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaState {
    versions: BTreeSet<i64>,
}

impl SchemaState {
    pub fn from_records(records: &[MigrationRecord]) -> Self {
        Self {
            versions: records.iter().map(|r| r.version).collect(),
        }
    }

    pub fn versions(&self) -> &BTreeSet<i64> {
        &self.versions
    }

    pub fn contains(&self, version: i64) -> bool {
        self.versions.contains(&version)
    }

    /// Highest applied version
    pub fn current_version(&self) -> Option<i64> {
        self.versions.iter().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub(crate) fn insert(&mut self, version: i64) {
        self.versions.insert(version);
    }

    pub(crate) fn remove(&mut self, version: i64) {
        self.versions.remove(&version);
    }
}

/// Database version compared with the newest registered migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseStatus {
    /// No migration has ever been applied
    FreshInstall,
    UpToDate,
    /// The registry knows newer versions than the database
    RequiresUpgrade,
    /// The database is ahead of this build's registry
    RequiresDowngrade,
}

impl DatabaseStatus {
    /// `has_pending` is true when a registered version below the database
    /// version was never applied, so a gap still counts as an upgrade.
    pub fn evaluate(current: Option<i64>, latest: Option<i64>, has_pending: bool) -> Self {
        match (current, latest) {
            (None, _) => DatabaseStatus::FreshInstall,
            (Some(_), None) => DatabaseStatus::RequiresDowngrade,
            (Some(current), Some(latest)) if current == latest && has_pending => {
                DatabaseStatus::RequiresUpgrade
            }
            (Some(current), Some(latest)) if current == latest => DatabaseStatus::UpToDate,
            (Some(current), Some(latest)) if current > latest => DatabaseStatus::RequiresDowngrade,
            (Some(_), Some(_)) => DatabaseStatus::RequiresUpgrade,
        }
    }
}

/// Runner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    Idle,
    Resolving,
    Scanning,
    Applying { version: i64 },
    Done,
    Failed { version: Option<i64> },
}

/// Outcome of one applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub version: i64,
    pub label: String,
    pub isolation: Isolation,
    /// DDL and raw statements executed
    pub statements: usize,
    pub rows_backfilled: u64,
    pub execution_time_ms: u128,
}

/// Result of running migrations
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRunResult {
    pub dialect: Dialect,
    /// Versions applied by this run, ascending
    pub applied: Vec<i64>,
    pub outcomes: Vec<MigrationOutcome>,
    /// Number of registered migrations that were already applied
    pub skipped_count: usize,
    pub final_state: SchemaState,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationRunResult {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Result of rolling back migrations
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    /// Versions rolled back, in the order they were reverted (descending)
    pub rolled_back: Vec<i64>,
    pub final_state: SchemaState,
    pub execution_time_ms: u128,
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MigrationStatus {
    /// Migration is pending (not yet applied)
    Pending,
    /// Migration has been applied
    Applied { applied_at: DateTime<Utc> },
}

/// Statements a pending migration would run, rendered without executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMigration {
    pub version: i64,
    pub label: String,
    pub isolation: Isolation,
    /// One line per step: DDL text, raw SQL or a backfill description
    pub statements: Vec<String>,
}
