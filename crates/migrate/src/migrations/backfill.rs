//! Backfill Executor - batched per-row data migrations
//!
//! Rows are read in primary-key order using keyset pagination, so memory use
//! is bounded by the batch size no matter how large the table is. Every row the
//! transform changes is written back with its own single-row `UPDATE`, which
//! keeps failures attributable to one row.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::backends::{DatabaseConnection, DatabaseRow, DatabaseValue};
use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult};
use crate::security::{validate_identifier, validate_identifiers};

/// Default number of rows fetched per batch
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Per-row transform: `Some(update)` persists the update, `None` skips the row
pub type RowTransform = Arc<dyn Fn(&DatabaseRow) -> Option<RowUpdate> + Send + Sync>;

/// Column assignments produced for one row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    assignments: Vec<(String, DatabaseValue)>,
}

impl RowUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a column, replacing an earlier assignment to the same column
    pub fn set(mut self, column: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        let column = column.into();
        let value = value.into();
        match self.assignments.iter_mut().find(|(c, _)| *c == column) {
            Some(existing) => existing.1 = value,
            None => self.assignments.push((column, value)),
        }
        self
    }

    pub fn assignments(&self) -> &[(String, DatabaseValue)] {
        &self.assignments
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// A row-level data migration over one table
#[derive(Clone)]
pub struct BackfillJob {
    pub table: String,
    /// Primary key column used for ordering and for the per-row `UPDATE`
    pub key_column: String,
    pub batch_size: usize,
    transform: RowTransform,
}

impl BackfillJob {
    pub fn new<F>(table: impl Into<String>, batch_size: usize, transform: F) -> Self
    where
        F: Fn(&DatabaseRow) -> Option<RowUpdate> + Send + Sync + 'static,
    {
        Self {
            table: table.into(),
            key_column: "id".to_string(),
            batch_size,
            transform: Arc::new(transform),
        }
    }

    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    /// Run the transform on one row
    pub fn transform(&self, row: &DatabaseRow) -> Option<RowUpdate> {
        (self.transform)(row)
    }
}

impl fmt::Debug for BackfillJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillJob")
            .field("table", &self.table)
            .field("key_column", &self.key_column)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Transform that gives every row without a value in `column` a random UUID
///
/// Values are v4 UUIDs rendered in the canonical 36-character hyphenated
/// form. Rows that already carry a non-blank value are skipped, which makes
/// the transform safe to re-run after a partial backfill.
pub fn assign_uuid_if_absent(
    column: impl Into<String>,
) -> impl Fn(&DatabaseRow) -> Option<RowUpdate> + Send + Sync + 'static {
    let column = column.into();
    move |row| {
        let absent = row.get(&column).map_or(true, DatabaseValue::is_blank);
        absent.then(|| RowUpdate::new().set(column.clone(), Uuid::new_v4()))
    }
}

/// Executes [`BackfillJob`]s against a connection
#[derive(Debug, Clone, Copy)]
pub struct BackfillExecutor {
    dialect: Dialect,
}

impl BackfillExecutor {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Run the job and return the number of rows updated
    ///
    /// Stops at the first row that fails to persist. Rows written before the
    /// failure are not compensated; whether they survive is decided by the
    /// transaction (if any) the caller runs this in.
    pub async fn run(&self, job: &BackfillJob, conn: &mut dyn DatabaseConnection) -> MigrationResult<u64> {
        validate_identifiers([job.table.as_str(), job.key_column.as_str()])?;
        if job.batch_size == 0 {
            return Err(MigrationError::Configuration(format!(
                "backfill of '{}' needs a batch size greater than zero",
                job.table
            )));
        }

        let mut last_key: Option<DatabaseValue> = None;
        let mut scanned: u64 = 0;
        let mut updated: u64 = 0;

        loop {
            let (sql, params) = self.batch_sql(job, last_key.as_ref());
            let rows = conn.fetch_all(&sql, &params).await?;
            let fetched = rows.len();

            for row in &rows {
                let key = row.require(&job.key_column)?.clone();
                if let Some(update) = job.transform(row).filter(|u| !u.is_empty()) {
                    self.persist_row(job, &key, &update, conn).await?;
                    updated += 1;
                }
                last_key = Some(key);
            }

            scanned += fetched as u64;
            tracing::debug!(
                "Backfill {}: scanned {} rows, updated {} so far",
                job.table,
                scanned,
                updated
            );

            if fetched < job.batch_size {
                break;
            }
        }

        tracing::info!("Backfilled {} of {} rows in {}", updated, scanned, job.table);
        Ok(updated)
    }

    async fn persist_row(
        &self,
        job: &BackfillJob,
        key: &DatabaseValue,
        update: &RowUpdate,
        conn: &mut dyn DatabaseConnection,
    ) -> MigrationResult<()> {
        for (column, _) in update.assignments() {
            validate_identifier(column)?;
        }

        let (sql, params) = self.update_sql(job, key, update);
        conn.execute(&sql, &params)
            .await
            .map_err(|e| MigrationError::BackfillRowError {
                table: job.table.clone(),
                row_key: key.to_string(),
                cause: e.to_string(),
            })?;
        Ok(())
    }

    fn batch_sql(&self, job: &BackfillJob, after: Option<&DatabaseValue>) -> (String, Vec<DatabaseValue>) {
        let mut sql = format!("SELECT * FROM {}", job.table);
        let mut params = Vec::new();
        if let Some(key) = after {
            sql.push_str(&format!(" WHERE {} > {}", job.key_column, self.dialect.placeholder(0)));
            params.push(key.clone());
        }
        sql.push_str(&format!(" ORDER BY {}", job.key_column));
        match self.dialect {
            Dialect::Generic => sql.push_str(&format!(" FETCH FIRST {} ROWS ONLY", job.batch_size)),
            _ => sql.push_str(&format!(" LIMIT {}", job.batch_size)),
        }
        (sql, params)
    }

    fn update_sql(&self, job: &BackfillJob, key: &DatabaseValue, update: &RowUpdate) -> (String, Vec<DatabaseValue>) {
        let assignments = update.assignments();
        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = {}", column, self.dialect.placeholder(i)))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            job.table,
            set_clause,
            job.key_column,
            self.dialect.placeholder(assignments.len())
        );

        let mut params: Vec<DatabaseValue> = assignments.iter().map(|(_, v)| v.clone()).collect();
        params.push(key.clone());
        (sql, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, kee: Option<&str>) -> DatabaseRow {
        DatabaseRow::new(
            vec!["id".to_string(), "kee".to_string()],
            vec![DatabaseValue::Int64(id), DatabaseValue::from(kee)],
        )
    }

    #[test]
    fn test_assign_uuid_if_absent() {
        let transform = assign_uuid_if_absent("kee");

        let update = transform(&row(1, None)).unwrap();
        let (column, value) = &update.assignments()[0];
        assert_eq!(column, "kee");
        let value = value.as_str().unwrap();
        assert_eq!(value.len(), 36);
        assert!(Uuid::parse_str(value).is_ok());

        assert!(transform(&row(2, Some(""))).is_some());
        assert!(transform(&row(3, Some("already-set"))).is_none());
    }

    #[test]
    fn test_row_update_replaces_same_column() {
        let update = RowUpdate::new().set("kee", "a").set("name", "n").set("kee", "b");
        assert_eq!(
            update.assignments(),
            &[
                ("kee".to_string(), DatabaseValue::from("b")),
                ("name".to_string(), DatabaseValue::from("n")),
            ]
        );
    }

    #[test]
    fn test_batch_sql_uses_keyset_pagination() {
        let job = BackfillJob::new("action_plans", 100, |_| None);

        let (sql, params) = BackfillExecutor::new(Dialect::PostgreSql).batch_sql(&job, None);
        assert_eq!(sql, "SELECT * FROM action_plans ORDER BY id LIMIT 100");
        assert!(params.is_empty());

        let key = DatabaseValue::Int64(42);
        let (sql, params) = BackfillExecutor::new(Dialect::PostgreSql).batch_sql(&job, Some(&key));
        assert_eq!(sql, "SELECT * FROM action_plans WHERE id > $1 ORDER BY id LIMIT 100");
        assert_eq!(params, vec![key]);

        let (sql, _) = BackfillExecutor::new(Dialect::Generic).batch_sql(&job, None);
        assert!(sql.ends_with("FETCH FIRST 100 ROWS ONLY"));
    }

    #[test]
    fn test_update_sql_is_single_row() {
        let job = BackfillJob::new("action_plans", 10, |_| None).key_column("plan_id");
        let update = RowUpdate::new().set("kee", "abc");

        let (sql, params) =
            BackfillExecutor::new(Dialect::MySqlFamily).update_sql(&job, &DatabaseValue::Int64(7), &update);
        assert_eq!(sql, "UPDATE action_plans SET kee = ? WHERE plan_id = ?");
        assert_eq!(params, vec![DatabaseValue::from("abc"), DatabaseValue::Int64(7)]);
    }
}
