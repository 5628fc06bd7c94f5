//! Advisory lock that keeps a single runner applying migrations
//!
//! The lock is a single row (id = 1) in a dedicated table. Inserting it takes
//! the lock; the primary key makes a second insert fail while it is held.
//! Acquisition happens outside any migration transaction so a commit or
//! rollback of migration work never releases it.

use chrono::{DateTime, Utc};

use crate::backends::{DatabaseConnection, DatabaseValue};
use crate::config::MigrationConfig;
use crate::dialect::Dialect;
use crate::error::{MigrationError, MigrationResult};

const LOCK_ROW_ID: i64 = 1;

/// Current owner of the lock row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: String,
    pub locked_at: String,
}

impl LockHolder {
    /// Age of the lock, when its timestamp parses
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        DateTime::parse_from_rfc3339(&self.locked_at)
            .ok()
            .map(|at| now - at.with_timezone(&Utc))
    }
}

/// Table-based advisory lock
pub struct MigrationLock<'a> {
    config: &'a MigrationConfig,
    dialect: Dialect,
}

impl<'a> MigrationLock<'a> {
    pub fn new(config: &'a MigrationConfig, dialect: Dialect) -> Self {
        Self { config, dialect }
    }

    /// SQL to create the lock table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id INTEGER NOT NULL PRIMARY KEY,\n    \
                owner VARCHAR(64) NOT NULL,\n    \
                locked_at VARCHAR(40) NOT NULL\n\
            )",
            self.config.lock_table
        )
    }

    pub async fn ensure_table(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        conn.execute(&self.create_table_sql(), &[]).await.map_err(|e| {
            MigrationError::Database(format!("Failed to create lock table: {}", e))
        })?;
        Ok(())
    }

    /// Take the lock or fail with `LockContention`
    ///
    /// An existing row is contention even when it carries this runner's
    /// owner name, since several processes may share a configured owner.
    /// Only a stale row is taken over.
    pub async fn acquire(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        if let Some(holder) = self.holder(conn).await? {
            if !self.is_stale(&holder) {
                return Err(contention(holder));
            }
            self.take_over(conn, &holder).await?;
        }

        match self.insert(conn).await {
            Ok(()) => {
                tracing::info!("Acquired migration lock as {}", self.config.lock_owner);
                Ok(())
            }
            Err(insert_err) => match self.holder(conn).await? {
                // Another runner won the race between our check and insert
                Some(holder) => Err(contention(holder)),
                None => Err(insert_err),
            },
        }
    }

    /// Release the lock if this runner holds it
    pub async fn release(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        let sql = format!(
            "DELETE FROM {} WHERE id = {} AND owner = {}",
            self.config.lock_table,
            self.dialect.placeholder(0),
            self.dialect.placeholder(1)
        );
        let released = conn
            .execute(
                &sql,
                &[DatabaseValue::Int64(LOCK_ROW_ID), self.config.lock_owner.as_str().into()],
            )
            .await?;

        if released == 0 {
            tracing::warn!(
                "Migration lock was not held by {} at release",
                self.config.lock_owner
            );
        } else {
            tracing::info!("Released migration lock");
        }
        Ok(())
    }

    /// Read the current holder, if any
    pub async fn holder(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<Option<LockHolder>> {
        let sql = format!(
            "SELECT owner, locked_at FROM {} WHERE id = {}",
            self.config.lock_table,
            self.dialect.placeholder(0)
        );
        let row = conn
            .fetch_optional(&sql, &[DatabaseValue::Int64(LOCK_ROW_ID)])
            .await?;

        match row {
            Some(row) => Ok(Some(LockHolder {
                owner: row.try_get_string("owner")?.unwrap_or_default(),
                locked_at: row.try_get_string("locked_at")?.unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }

    fn is_stale(&self, holder: &LockHolder) -> bool {
        let Some(threshold) = self.config.stale_lock_after else {
            return false;
        };
        match (holder.age(Utc::now()), chrono::Duration::from_std(threshold)) {
            (Some(age), Ok(threshold)) => age > threshold,
            _ => false,
        }
    }

    async fn take_over(&self, conn: &mut dyn DatabaseConnection, holder: &LockHolder) -> MigrationResult<()> {
        tracing::warn!(
            "Taking over stale migration lock held by {} since {}",
            holder.owner,
            holder.locked_at
        );
        let sql = format!(
            "DELETE FROM {} WHERE id = {} AND owner = {} AND locked_at = {}",
            self.config.lock_table,
            self.dialect.placeholder(0),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        conn.execute(
            &sql,
            &[
                DatabaseValue::Int64(LOCK_ROW_ID),
                holder.owner.as_str().into(),
                holder.locked_at.as_str().into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert(&self, conn: &mut dyn DatabaseConnection) -> MigrationResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, owner, locked_at) VALUES ({}, {}, {})",
            self.config.lock_table,
            self.dialect.placeholder(0),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        conn.execute(
            &sql,
            &[
                DatabaseValue::Int64(LOCK_ROW_ID),
                self.config.lock_owner.as_str().into(),
                Utc::now().to_rfc3339().into(),
            ],
        )
        .await?;
        Ok(())
    }
}

fn contention(holder: LockHolder) -> MigrationError {
    MigrationError::LockContention {
        holder: holder.owner,
        locked_at: holder.locked_at,
    }
}
