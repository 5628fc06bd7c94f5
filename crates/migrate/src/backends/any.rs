//! sqlx-backed connection
//!
//! Wraps a single [`AnyConnection`] so the same engine drives PostgreSQL, MySQL /
//! MariaDB and SQLite. Placeholders are passed through untouched; callers build
//! them with [`Dialect::placeholder`](crate::dialect::Dialect::placeholder).

use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyRow};
use sqlx::{AnyConnection, Column, Connection, Executor, Row, TypeInfo, ValueRef};

use super::core::{DatabaseConnection, DatabaseRow, DatabaseValue, ServerInfo};
use crate::error::{MigrationError, MigrationResult};

type AnyQuery<'q> = sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>;

/// [`DatabaseConnection`] over a sqlx `Any` connection
pub struct SqlxConnection {
    inner: AnyConnection,
}

impl SqlxConnection {
    /// Open a connection from a database URL (`postgres://`, `mysql://`, `sqlite:`)
    pub async fn connect(database_url: &str) -> MigrationResult<Self> {
        install_default_drivers();
        let inner = AnyConnection::connect(database_url)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to connect to database: {}", e)))?;

        tracing::debug!("Connected to {} database", inner.backend_name());
        Ok(Self { inner })
    }

    /// Wrap an already established connection
    pub fn from_connection(inner: AnyConnection) -> Self {
        Self { inner }
    }

    /// Get the underlying sqlx connection
    pub fn inner_mut(&mut self) -> &mut AnyConnection {
        &mut self.inner
    }

    /// Close the connection gracefully
    pub async fn close(self) -> MigrationResult<()> {
        self.inner.close().await?;
        Ok(())
    }

    fn bind_params<'q>(sql: &'q str, params: &[DatabaseValue]) -> AnyQuery<'q> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                DatabaseValue::Null => query.bind(Option::<String>::None),
                DatabaseValue::Bool(b) => query.bind(*b),
                DatabaseValue::Int32(i) => query.bind(*i),
                DatabaseValue::Int64(i) => query.bind(*i),
                DatabaseValue::Float64(f) => query.bind(*f),
                DatabaseValue::String(s) => query.bind(s.clone()),
                DatabaseValue::Bytes(b) => query.bind(b.clone()),
            };
        }
        query
    }
}

#[async_trait]
impl DatabaseConnection for SqlxConnection {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrationResult<u64> {
        let result = if params.is_empty() {
            // Unprepared, so DDL and transaction control work on every driver
            (&mut self.inner).execute(sql).await?
        } else {
            Self::bind_params(sql, params).execute(&mut self.inner).await?
        };
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> MigrationResult<Vec<DatabaseRow>> {
        let rows = Self::bind_params(sql, params).fetch_all(&mut self.inner).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn begin(&mut self) -> MigrationResult<()> {
        (&mut self.inner)
            .execute("BEGIN")
            .await
            .map_err(|e| MigrationError::TransactionAbort {
                reason: format!("Failed to start transaction: {}", e),
            })?;
        Ok(())
    }

    async fn commit(&mut self) -> MigrationResult<()> {
        (&mut self.inner)
            .execute("COMMIT")
            .await
            .map_err(|e| MigrationError::TransactionAbort {
                reason: format!("Failed to commit transaction: {}", e),
            })?;
        Ok(())
    }

    async fn rollback(&mut self) -> MigrationResult<()> {
        (&mut self.inner)
            .execute("ROLLBACK")
            .await
            .map_err(|e| MigrationError::TransactionAbort {
                reason: format!("Failed to roll back transaction: {}", e),
            })?;
        Ok(())
    }

    async fn server_info(&mut self) -> MigrationResult<ServerInfo> {
        let backend = self.inner.backend_name().to_string();
        let version_sql = match backend.as_str() {
            "PostgreSQL" => Some("SHOW server_version"),
            "MySQL" => Some("SELECT VERSION()"),
            "SQLite" => Some("SELECT sqlite_version()"),
            _ => None,
        };

        let version = match version_sql {
            Some(sql) => {
                let row = sqlx::query(sql).fetch_one(&mut self.inner).await?;
                Some(row.try_get::<String, _>(0)?)
            }
            None => None,
        };

        // MariaDB speaks the MySQL protocol; only the version string tells them apart
        let product = match &version {
            Some(v) if backend == "MySQL" && v.to_lowercase().contains("mariadb") => "MariaDB".to_string(),
            _ => backend,
        };

        Ok(ServerInfo::new(product, version))
    }
}

fn decode_row(row: &AnyRow) -> MigrationResult<DatabaseRow> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    for (index, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());

        // SQLite reports an unset column as a non-null value of type NULL
        let type_name = {
            let raw = row.try_get_raw(index)?;
            let name = raw.type_info().name().to_uppercase();
            if raw.is_null() || name == "NULL" {
                None
            } else {
                Some(name)
            }
        };

        let value = match type_name.as_deref() {
            None => DatabaseValue::Null,
            Some("BOOLEAN") => DatabaseValue::Bool(row.try_get(index)?),
            Some("SMALLINT") => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(index)?)),
            Some("INTEGER") => DatabaseValue::Int32(row.try_get(index)?),
            Some("BIGINT") => DatabaseValue::Int64(row.try_get(index)?),
            Some("REAL") => DatabaseValue::Float64(f64::from(row.try_get::<f32, _>(index)?)),
            Some("DOUBLE") => DatabaseValue::Float64(row.try_get(index)?),
            Some("BLOB") => DatabaseValue::Bytes(row.try_get(index)?),
            Some(_) => DatabaseValue::String(row.try_get(index)?),
        };
        values.push(value);
    }

    Ok(DatabaseRow::new(columns, values))
}
