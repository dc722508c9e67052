#![cfg(feature = "sqlite")]

use jobstats_db::{
    codec, pool, ConnectionConfig, GpuStats, JobKey, JobStats, NodeStats, RelationalStore,
    StatsCoordinator, StatsPayload, StorageMode, StoreError, TableNames,
};
use std::path::Path;
use tempfile::TempDir;

async fn relational() -> (StatsCoordinator, RelationalStore) {
    let pool = pool::connect(&ConnectionConfig::sqlite_memory()).await.unwrap();
    relational_on(pool).await
}

async fn relational_on(pool: pool::DbPool) -> (StatsCoordinator, RelationalStore) {
    let store = RelationalStore::new(pool, TableNames::default()).unwrap();
    store.ensure_schema().await.unwrap();
    let coordinator =
        StatsCoordinator::new(StorageMode::Relational, None, Some(store.clone())).unwrap();
    (coordinator, store)
}

async fn file_pool(path: &Path) -> pool::DbPool {
    let config = ConnectionConfig {
        max_connections: 2,
        ..ConnectionConfig::from_url(format!("sqlite:{}", path.display()))
    };
    pool::connect(&config).await.unwrap()
}

fn gpu(index: &str, utilization: f64) -> GpuStats {
    GpuStats {
        index: index.to_string(),
        utilization: Some(utilization),
        used_memory: Some(2_000_000_000),
        total_memory: Some(16_000_000_000),
    }
}

fn node(name: &str, cpus: i64, gpus: Vec<GpuStats>) -> NodeStats {
    NodeStats {
        name: name.to_string(),
        cpus: Some(cpus),
        total_memory: Some(64_000_000_000),
        used_memory: Some(12_000_000_000),
        total_time: Some(1800.5),
        gpus,
    }
}

fn two_node_job() -> StatsPayload {
    StatsPayload::Stats(JobStats {
        total_time: Some(3600),
        gpus: Some(1),
        nodes: vec![node("n1", 4, vec![gpu("0", 85.5)]), node("n2", 8, vec![])],
    })
}

async fn count(store: &RelationalStore, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_node_job_round_trip() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);
    let payload = two_node_job();

    coordinator.save(&key, &payload).await.unwrap();

    assert_eq!(count(&store, "job_summary").await, 1);
    assert_eq!(count(&store, "job_nodes").await, 2);
    assert_eq!(count(&store, "job_gpu_metrics").await, 1);

    let stored = store.read_rows(&key).await.unwrap().unwrap();
    assert_eq!(stored.summary.total_time, Some(3600));
    assert_eq!(stored.summary.gpu_count, Some(1));
    assert_eq!(stored.nodes[0].node_name, "n1");
    assert_eq!(stored.nodes[1].node_name, "n2");
    assert_eq!(stored.gpus[0][0].utilization_percent, Some(85.5));
    assert!(stored.gpus[1].is_empty());

    let blob = stored.summary.admin_comment.as_deref().unwrap();
    assert!(blob.starts_with(codec::BLOB_PREFIX));
    assert_eq!(codec::decode(blob).unwrap(), payload);

    assert_eq!(coordinator.load(&key).await.unwrap(), Some(payload));
}

#[tokio::test]
async fn test_rewrite_replaces_nodes() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);
    coordinator.save(&key, &two_node_job()).await.unwrap();

    let replacement = StatsPayload::Stats(JobStats {
        total_time: Some(4000),
        gpus: Some(0),
        nodes: vec![node("n3", 16, vec![])],
    });
    coordinator.save(&key, &replacement).await.unwrap();

    assert_eq!(count(&store, "job_summary").await, 1);
    assert_eq!(count(&store, "job_nodes").await, 1);
    assert_eq!(count(&store, "job_gpu_metrics").await, 0);
    assert_eq!(coordinator.load(&key).await.unwrap(), Some(replacement));
}

#[tokio::test]
async fn test_rewrite_down_to_one_node() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);
    coordinator.save(&key, &two_node_job()).await.unwrap();

    let rewrite = StatsPayload::Stats(JobStats {
        total_time: Some(7200),
        gpus: Some(1),
        nodes: vec![node("n1", 4, vec![gpu("0", 42.0)])],
    });
    coordinator.save(&key, &rewrite).await.unwrap();

    let stored = store.read_rows(&key).await.unwrap().unwrap();
    let names: Vec<&str> = stored.nodes.iter().map(|n| n.node_name.as_str()).collect();
    assert_eq!(names, vec!["n1"]);
    assert_eq!(stored.summary.total_time, Some(7200));
    assert_eq!(stored.gpus.len(), 1);
    assert_eq!(stored.gpus[0][0].utilization_percent, Some(42.0));
    assert_eq!(count(&store, "job_nodes").await, 1);
    assert_eq!(count(&store, "job_gpu_metrics").await, 1);
    assert_eq!(coordinator.load(&key).await.unwrap(), Some(rewrite));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_saves_of_one_job() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("stats.db");
    let (first, store) = relational_on(file_pool(&path).await).await;
    let (second, _) = relational_on(file_pool(&path).await).await;

    let key = JobKey::new("main", 100);
    let a = two_node_job();
    let b = StatsPayload::Stats(JobStats {
        total_time: Some(120),
        gpus: Some(0),
        nodes: vec![node("n7", 2, vec![])],
    });

    let (saved_a, saved_b) = tokio::join!(first.save(&key, &a), second.save(&key, &b));
    saved_a.unwrap();
    saved_b.unwrap();

    assert_eq!(count(&store, "job_summary").await, 1);
    let loaded = first.load(&key).await.unwrap().unwrap();
    assert!(loaded == a || loaded == b, "unexpected payload {:?}", loaded);

    let StatsPayload::Stats(stats) = &loaded else {
        panic!("expected stats, got {:?}", loaded);
    };
    assert_eq!(count(&store, "job_nodes").await, stats.nodes.len() as i64);
    assert_eq!(second.load(&key).await.unwrap(), Some(loaded));
}

#[tokio::test]
async fn test_rewrite_is_idempotent_and_keeps_created_at() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);

    coordinator.save(&key, &two_node_job()).await.unwrap();
    let first = store.read_rows(&key).await.unwrap().unwrap();

    coordinator.save(&key, &two_node_job()).await.unwrap();
    let second = store.read_rows(&key).await.unwrap().unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.summary.created_at, second.summary.created_at);
    assert!(second.summary.updated_at >= first.summary.updated_at);
    assert_eq!(first.nodes, second.nodes);
    assert_eq!(first.gpus, second.gpus);
    assert_eq!(count(&store, "job_nodes").await, 2);
}

#[tokio::test]
async fn test_same_job_id_on_different_clusters() {
    let (coordinator, store) = relational().await;
    coordinator.save(&JobKey::new("della", 7), &two_node_job()).await.unwrap();
    coordinator
        .save(&JobKey::new("stellar", 7), &StatsPayload::NoData)
        .await
        .unwrap();

    assert_eq!(count(&store, "job_summary").await, 2);
    assert_eq!(
        coordinator.load(&JobKey::new("stellar", 7)).await.unwrap(),
        Some(StatsPayload::NoData)
    );
    assert_eq!(
        coordinator.load(&JobKey::new("della", 7)).await.unwrap(),
        Some(two_node_job())
    );
}

#[tokio::test]
async fn test_marker_payloads() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 5);
    coordinator.save(&key, &StatsPayload::TooShort).await.unwrap();

    let stored = store.read_rows(&key).await.unwrap().unwrap();
    assert_eq!(stored.summary.admin_comment.as_deref(), Some(codec::SHORT_MARKER));
    assert_eq!(stored.summary.total_time, None);
    assert!(stored.nodes.is_empty());
    assert_eq!(coordinator.load(&key).await.unwrap(), Some(StatsPayload::TooShort));
}

#[tokio::test]
async fn test_failed_write_leaves_previous_rows() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);
    let before = StatsPayload::Stats(JobStats {
        total_time: Some(10),
        gpus: None,
        nodes: vec![node("n1", 4, vec![])],
    });
    coordinator.save(&key, &before).await.unwrap();

    // GPU inserts fail after the summary upsert and node replacement ran.
    sqlx::query("DROP TABLE job_gpu_metrics")
        .execute(store.pool())
        .await
        .unwrap();

    let err = coordinator.save(&key, &two_node_job()).await.unwrap_err();
    assert!(!err.is_retryable());

    assert_eq!(coordinator.load(&key).await.unwrap(), Some(before));
    assert_eq!(count(&store, "job_nodes").await, 1);
}

#[tokio::test]
async fn test_failed_first_write_leaves_no_trace() {
    let (coordinator, store) = relational().await;
    sqlx::query("DROP TABLE job_gpu_metrics")
        .execute(store.pool())
        .await
        .unwrap();

    let key = JobKey::new("main", 100);
    assert!(coordinator.save(&key, &two_node_job()).await.is_err());

    assert_eq!(count(&store, "job_summary").await, 0);
    assert_eq!(count(&store, "job_nodes").await, 0);
    assert!(store.read_rows(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_rows_rejected_before_write() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);
    let payload = StatsPayload::Stats(JobStats {
        total_time: Some(60),
        gpus: Some(1),
        nodes: vec![node("n1", 4, vec![gpu("0", 150.0)])],
    });

    let err = coordinator.save(&key, &payload).await.unwrap_err();
    assert_eq!(err.kind(), "constraint_violated");
    assert_eq!(count(&store, "job_summary").await, 0);
}

#[tokio::test]
async fn test_delete_cascades() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 100);
    coordinator.save(&key, &two_node_job()).await.unwrap();

    assert!(store.delete(&key).await.unwrap());
    assert!(!store.delete(&key).await.unwrap());

    assert_eq!(count(&store, "job_summary").await, 0);
    assert_eq!(count(&store, "job_nodes").await, 0);
    assert_eq!(count(&store, "job_gpu_metrics").await, 0);
    assert_eq!(coordinator.load(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_blob_only_row_decodes_retained_blob() {
    let (coordinator, store) = relational().await;
    let blob = codec::encode(&two_node_job()).unwrap();
    sqlx::query("INSERT INTO job_summary (cluster, jobid, admin_comment) VALUES (?, ?, ?)")
        .bind("main")
        .bind(9_i64)
        .bind(&blob)
        .execute(store.pool())
        .await
        .unwrap();

    let key = JobKey::new("main", 9);
    assert_eq!(coordinator.load(&key).await.unwrap(), Some(two_node_job()));
    assert_eq!(coordinator.load_blob(&key).await.unwrap(), Some(blob));
}

#[tokio::test]
async fn test_gpu_without_readings() {
    let (coordinator, _store) = relational().await;
    let key = JobKey::new("main", 11);
    let payload = StatsPayload::Stats(JobStats {
        total_time: Some(60),
        gpus: Some(1),
        nodes: vec![node(
            "g1",
            8,
            vec![GpuStats {
                index: "GPU-3f2a".to_string(),
                ..Default::default()
            }],
        )],
    });

    coordinator.save(&key, &payload).await.unwrap();
    assert_eq!(coordinator.load(&key).await.unwrap(), Some(payload));
}

#[tokio::test]
async fn test_large_job_spans_insert_batches() {
    let (coordinator, store) = relational().await;
    let key = JobKey::new("main", 12);
    let nodes: Vec<NodeStats> = (0..400)
        .map(|i| {
            node(
                &format!("node{:03}", i),
                32,
                vec![gpu("0", 50.0), gpu("1", 75.25)],
            )
        })
        .collect();
    let payload = StatsPayload::Stats(JobStats {
        total_time: Some(86_400),
        gpus: Some(800),
        nodes,
    });

    coordinator.save(&key, &payload).await.unwrap();

    assert_eq!(count(&store, "job_nodes").await, 400);
    assert_eq!(count(&store, "job_gpu_metrics").await, 800);
    assert_eq!(coordinator.load(&key).await.unwrap(), Some(payload));
}

#[tokio::test]
async fn test_recent_newest_first() {
    let (coordinator, store) = relational().await;
    for job_id in 1..=3 {
        coordinator
            .save(&JobKey::new("main", job_id), &StatsPayload::NoData)
            .await
            .unwrap();
    }

    let recent = store.recent(2).await.unwrap();
    let ids: Vec<i64> = recent.iter().map(|s| s.job_id).collect();
    assert_eq!(ids, vec![3, 2]);
    assert!(recent[0].updated_at.is_some());
}

#[tokio::test]
async fn test_custom_table_names() {
    let pool = pool::connect(&ConnectionConfig::sqlite_memory()).await.unwrap();
    let tables = TableNames {
        summary: "stats_summary".to_string(),
        nodes: "stats_nodes".to_string(),
        gpu_metrics: "stats_gpus".to_string(),
    };
    let store = RelationalStore::new(pool, tables).unwrap();
    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();

    let coordinator =
        StatsCoordinator::new(StorageMode::Relational, None, Some(store.clone())).unwrap();
    let key = JobKey::new("main", 1);
    coordinator.save(&key, &two_node_job()).await.unwrap();
    assert_eq!(count(&store, "stats_nodes").await, 2);
}

#[tokio::test]
async fn test_rejects_unsafe_table_names() {
    let pool = pool::connect(&ConnectionConfig::sqlite_memory()).await.unwrap();
    let tables = TableNames {
        summary: "job_summary; DROP TABLE x".to_string(),
        ..Default::default()
    };
    let err = RelationalStore::new(pool, tables).unwrap_err();
    assert!(matches!(err, StoreError::ConstraintViolated(_)));
}
