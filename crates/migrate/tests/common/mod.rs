//! Shared helpers for the SQLite-backed integration tests

#![allow(dead_code)]

use std::path::Path;

use elif_migrate::{DatabaseConnection, MigrationConfig, SqlxConnection};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("elif_migrate=debug")
        .with_test_writer()
        .try_init();
}

/// Private in-memory database
pub async fn memory_db() -> SqlxConnection {
    init_tracing();
    SqlxConnection::connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

/// Connection to a database file, created on first use
pub async fn file_db(path: &Path) -> SqlxConnection {
    init_tracing();
    SqlxConnection::connect(&format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .expect("file-backed sqlite")
}

pub fn test_config(owner: &str) -> MigrationConfig {
    MigrationConfig::default().with_lock_owner(owner)
}

pub async fn exec(conn: &mut SqlxConnection, sql: &str) {
    conn.execute(sql, &[]).await.expect(sql);
}

pub async fn scalar(conn: &mut SqlxConnection, sql: &str) -> i64 {
    let rows = conn.fetch_all(sql, &[]).await.expect(sql);
    rows[0]
        .get_by_index(0)
        .and_then(|v| v.as_i64())
        .expect("integer result")
}

pub async fn table_exists(conn: &mut SqlxConnection, table: &str) -> bool {
    let sql = format!(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '{}'",
        table
    );
    scalar(conn, &sql).await > 0
}

/// `action_plans` with `rows` rows and no `kee` column yet
pub async fn seed_action_plans(conn: &mut SqlxConnection, rows: i64) {
    exec(
        conn,
        "CREATE TABLE action_plans (id INTEGER PRIMARY KEY, title VARCHAR(100))",
    )
    .await;
    for id in 1..=rows {
        let sql = format!(
            "INSERT INTO action_plans (id, title) VALUES ({}, 'plan {}')",
            id, id
        );
        exec(conn, &sql).await;
    }
}

/// Abort any `UPDATE` of the row with `id`
pub async fn fail_updates_of(conn: &mut SqlxConnection, table: &str, id: i64) {
    let sql = format!(
        "CREATE TRIGGER fail_update_{table}_{id} BEFORE UPDATE ON {table} \
         WHEN NEW.id = {id} BEGIN SELECT RAISE(ABORT, 'row rejected'); END"
    );
    exec(conn, &sql).await;
}

pub async fn clear_failure(conn: &mut SqlxConnection, table: &str, id: i64) {
    exec(conn, &format!("DROP TRIGGER fail_update_{table}_{id}")).await;
}

pub async fn applied_versions(conn: &mut SqlxConnection) -> Vec<i64> {
    conn.fetch_all("SELECT version FROM elif_migrations ORDER BY version", &[])
        .await
        .expect("bookkeeping table")
        .iter()
        .filter_map(|row| row.try_get_i64("version").ok().flatten())
        .collect()
}
