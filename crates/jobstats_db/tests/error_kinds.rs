#![cfg(feature = "sqlite")]

use jobstats_db::{
    pool, ConnectionConfig, JobKey, JobStats, RelationalStore, StatsCoordinator, StatsPayload,
    StorageMode, TableNames,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn payload() -> StatsPayload {
    StatsPayload::Stats(JobStats {
        total_time: Some(60),
        gpus: Some(0),
        nodes: Vec::new(),
    })
}

/// File database with the tables in place, left open for the test.
async fn prepared(path: &Path) -> RelationalStore {
    let config = ConnectionConfig::from_url(format!("sqlite:{}", path.display()));
    let db = pool::connect(&config).await.unwrap();
    let store = RelationalStore::new(db, TableNames::default()).unwrap();
    store.ensure_schema().await.unwrap();
    store
}

fn coordinator(options: SqliteConnectOptions) -> StatsCoordinator {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_lazy_with(options);
    let store = RelationalStore::new(pool, TableNames::default()).unwrap();
    StatsCoordinator::new(StorageMode::Relational, None, Some(store)).unwrap()
}

#[tokio::test]
async fn test_read_only_database_is_permission_denied() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("stats.db");
    let _writer = prepared(&path).await;

    let read_only = coordinator(SqliteConnectOptions::new().filename(&path).read_only(true));
    let err = read_only
        .save(&JobKey::new("main", 1), &payload())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "permission_denied");
    assert!(!err.is_retryable());
    assert_eq!(read_only.load(&JobKey::new("main", 1)).await.unwrap(), None);
}

#[tokio::test]
async fn test_locked_database_is_retryable() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("stats.db");
    let holder = prepared(&path).await;

    let mut tx = holder.pool().begin().await.unwrap();
    sqlx::query("INSERT INTO job_summary (cluster, jobid) VALUES (?, ?)")
        .bind("main")
        .bind(1_i64)
        .execute(&mut *tx)
        .await
        .unwrap();

    let waiting = coordinator(
        SqliteConnectOptions::new()
            .filename(&path)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(50)),
    );
    let err = waiting
        .save(&JobKey::new("main", 2), &payload())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "unavailable");
    assert!(err.is_retryable());

    tx.rollback().await.unwrap();
    waiting.save(&JobKey::new("main", 2), &payload()).await.unwrap();
}
