mod common;

use common::*;
use elif_migrate::*;

fn reversible_registry() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();
    registry
        .register_all([
            Migration::new(1, "create projects")
                .create_table("projects", |t| {
                    t.id("id");
                    t.string("title", None);
                })
                .down(vec![MigrationStep::Change(StructuralChange::DropTable {
                    table: "projects".to_string(),
                })]),
            Migration::new(2, "add project kee")
                .add_column("projects", ColumnDef::string("kee").limit(400))
                .add_index(IndexDef::new("projects", &["kee"]))
                .down(vec![
                    MigrationStep::Change(StructuralChange::DropIndex {
                        table: "projects".to_string(),
                        name: "idx_projects_kee".to_string(),
                    }),
                    MigrationStep::Change(StructuralChange::DropColumn {
                        table: "projects".to_string(),
                        column: "kee".to_string(),
                    }),
                ]),
        ])
        .unwrap();
    registry
}

#[tokio::test]
async fn test_rollback_last_then_everything() {
    let mut conn = memory_db().await;
    let mut runner = MigrationRunner::with_config(reversible_registry(), test_config("rollback"));
    runner.apply_all(&mut conn).await.unwrap();

    let result = runner.rollback_last(&mut conn).await.unwrap();
    assert_eq!(result.rolled_back, vec![2]);
    assert_eq!(result.final_state.current_version(), Some(1));
    assert_eq!(applied_versions(&mut conn).await, vec![1]);
    assert_eq!(runner.status(&mut conn).await.unwrap(), DatabaseStatus::RequiresUpgrade);

    let result = runner.rollback_to(&mut conn, None).await.unwrap();
    assert_eq!(result.rolled_back, vec![1]);
    assert!(result.final_state.is_empty());
    assert!(!table_exists(&mut conn, "projects").await);
    assert_eq!(runner.status(&mut conn).await.unwrap(), DatabaseStatus::FreshInstall);

    // Reverted migrations are pending again
    let result = runner.apply_all(&mut conn).await.unwrap();
    assert_eq!(result.applied, vec![1, 2]);
}

#[tokio::test]
async fn test_rollback_to_target_reverts_newest_first() {
    let mut conn = memory_db().await;
    exec(&mut conn, "CREATE TABLE run_log (seq INTEGER PRIMARY KEY, version INTEGER)").await;

    let mut registry = MigrationRegistry::new();
    for version in 1..=4 {
        let undo = format!("INSERT INTO run_log (version) VALUES ({})", version);
        registry
            .register(
                Migration::new(version, format!("step {}", version))
                    .raw(RawStatement::any("SELECT 1"))
                    .down(vec![MigrationStep::Raw(RawStatement::any(undo))]),
            )
            .unwrap();
    }
    let mut runner = MigrationRunner::with_config(registry, test_config("rollback-to"));
    runner.apply_all(&mut conn).await.unwrap();

    let result = runner.rollback_to(&mut conn, Some(2)).await.unwrap();
    assert_eq!(result.rolled_back, vec![4, 3]);
    assert_eq!(applied_versions(&mut conn).await, vec![1, 2]);

    let order: Vec<i64> = conn
        .fetch_all("SELECT version FROM run_log ORDER BY seq", &[])
        .await
        .unwrap()
        .iter()
        .filter_map(|row| row.try_get_i64("version").unwrap())
        .collect();
    assert_eq!(order, vec![4, 3]);
}

#[tokio::test]
async fn test_irreversible_migration_blocks_rollback() {
    let mut conn = memory_db().await;
    let mut registry = MigrationRegistry::new();
    registry
        .register_all([
            Migration::new(1, "create projects").create_table("projects", |t| {
                t.id("id");
            }),
            Migration::new(2, "noop")
                .raw(RawStatement::any("SELECT 1"))
                .down(Vec::new()),
        ])
        .unwrap();
    let mut runner = MigrationRunner::with_config(registry, test_config("irreversible"));
    runner.apply_all(&mut conn).await.unwrap();

    let err = runner.rollback_to(&mut conn, None).await.unwrap_err();
    assert!(matches!(err, MigrationError::IrreversibleMigration { version: 1 }));
    assert_eq!(runner.state(), RunnerState::Failed { version: None });
    // Nothing was reverted, not even the reversible migration 2
    assert_eq!(applied_versions(&mut conn).await, vec![1, 2]);

    let result = runner.rollback_last(&mut conn).await.unwrap();
    assert_eq!(result.rolled_back, vec![2]);
}

#[tokio::test]
async fn test_rollback_with_nothing_applied() {
    let mut conn = memory_db().await;
    let mut runner = MigrationRunner::with_config(reversible_registry(), test_config("empty"));

    let result = runner.rollback_last(&mut conn).await.unwrap();
    assert!(result.rolled_back.is_empty());
}

#[tokio::test]
async fn test_rollback_blocked_by_lock_marks_runner_failed() {
    let mut conn = memory_db().await;
    let mut runner = MigrationRunner::with_config(reversible_registry(), test_config("rollback"));
    runner.apply_all(&mut conn).await.unwrap();

    let other = test_config("other-runner");
    MigrationLock::new(&other, Dialect::Sqlite)
        .acquire(&mut conn)
        .await
        .unwrap();

    let err = runner.rollback_last(&mut conn).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockContention);
    assert_eq!(runner.state(), RunnerState::Failed { version: None });
    assert_eq!(applied_versions(&mut conn).await, vec![1, 2]);
}
