mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use elif_migrate::*;

fn registry() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();
    registry
        .register(Migration::new(1, "create projects").create_table("projects", |t| {
            t.id("id");
        }))
        .unwrap();
    registry
}

#[tokio::test]
async fn test_held_lock_blocks_other_runner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("migrations.db");
    let mut holder_conn = file_db(&path).await;
    let mut runner_conn = file_db(&path).await;

    let holder_config = test_config("runner-a");
    let lock = MigrationLock::new(&holder_config, Dialect::Sqlite);
    lock.ensure_table(&mut holder_conn).await.unwrap();
    lock.acquire(&mut holder_conn).await.unwrap();
    assert_eq!(
        lock.acquire(&mut holder_conn).await.unwrap_err().kind(),
        ErrorKind::LockContention
    );

    let mut runner = MigrationRunner::with_config(registry(), test_config("runner-b"));
    let err = runner.apply_all(&mut runner_conn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert!(err.is_retryable());
    match err {
        MigrationError::LockContention { holder, .. } => assert_eq!(holder, "runner-a"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(runner.state(), RunnerState::Failed { version: None });
    assert!(!table_exists(&mut runner_conn, "projects").await);

    lock.release(&mut holder_conn).await.unwrap();
    let result = runner.apply_all(&mut runner_conn).await.unwrap();
    assert_eq!(result.applied, vec![1]);

    let holder = lock.holder(&mut holder_conn).await.unwrap();
    assert_eq!(holder, None);
}

#[tokio::test]
async fn test_runners_sharing_an_owner_name_still_exclude_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("migrations.db");
    let mut first_conn = file_db(&path).await;
    let mut second_conn = file_db(&path).await;

    let config = test_config("deploy");
    let lock = MigrationLock::new(&config, Dialect::Sqlite);
    lock.ensure_table(&mut first_conn).await.unwrap();
    lock.acquire(&mut first_conn).await.unwrap();

    let mut runner = MigrationRunner::with_config(registry(), test_config("deploy"));
    let err = runner.apply_all(&mut second_conn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert!(!table_exists(&mut second_conn, "projects").await);

    // The first holder keeps its lock
    let holder = lock.holder(&mut first_conn).await.unwrap().unwrap();
    assert_eq!(holder.owner, "deploy");

    lock.release(&mut first_conn).await.unwrap();
    assert_eq!(runner.apply_all(&mut second_conn).await.unwrap().applied, vec![1]);
}

#[tokio::test]
async fn test_stale_lock_is_taken_over() {
    let mut conn = memory_db().await;
    let config = test_config("runner-b").with_stale_lock_after(Duration::from_secs(60));
    MigrationLock::new(&config, Dialect::Sqlite)
        .ensure_table(&mut conn)
        .await
        .unwrap();

    let locked_at = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    conn.execute(
        "INSERT INTO elif_migrations_lock (id, owner, locked_at) VALUES (?, ?, ?)",
        &[1i64.into(), "crashed-runner".into(), locked_at.into()],
    )
    .await
    .unwrap();

    let mut runner = MigrationRunner::with_config(registry(), config);
    let result = runner.apply_all(&mut conn).await.unwrap();
    assert_eq!(result.applied, vec![1]);
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM elif_migrations_lock").await, 0);
}

#[tokio::test]
async fn test_recent_lock_is_not_taken_over() {
    let mut conn = memory_db().await;
    let config = test_config("runner-b").with_stale_lock_after(Duration::from_secs(3600));
    MigrationLock::new(&config, Dialect::Sqlite)
        .ensure_table(&mut conn)
        .await
        .unwrap();

    conn.execute(
        "INSERT INTO elif_migrations_lock (id, owner, locked_at) VALUES (?, ?, ?)",
        &[1i64.into(), "busy-runner".into(), Utc::now().to_rfc3339().into()],
    )
    .await
    .unwrap();

    let mut runner = MigrationRunner::with_config(registry(), config);
    let err = runner.apply_all(&mut conn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM elif_migrations_lock").await, 1);
}

#[tokio::test]
async fn test_lock_is_released_after_failed_migration() {
    let mut conn = memory_db().await;
    let mut registry = MigrationRegistry::new();
    registry
        .register(Migration::new(1, "broken").raw(RawStatement::any("DROP TABLE nowhere")))
        .unwrap();
    let mut runner = MigrationRunner::with_config(registry, test_config("runner-a"));

    assert!(runner.apply_all(&mut conn).await.is_err());
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM elif_migrations_lock").await, 0);
}

#[tokio::test]
async fn test_failed_release_keeps_the_committed_result() {
    let mut conn = memory_db().await;
    let mut registry = MigrationRegistry::new();
    registry
        .register(
            Migration::new(1, "drop lock table").raw(RawStatement::any("DROP TABLE elif_migrations_lock")),
        )
        .unwrap();
    let mut runner = MigrationRunner::with_config(registry, test_config("runner-a"));

    // Releasing fails because the lock table is gone, but the migration committed
    let result = runner.apply_all(&mut conn).await.unwrap();
    assert_eq!(result.applied, vec![1]);
    assert_eq!(runner.state(), RunnerState::Done);
    assert_eq!(applied_versions(&mut conn).await, vec![1]);
}
