//! Normalized storage in the external database.
//!
//! A write upserts the summary row keyed by `(cluster, jobid)`, deletes the
//! job's previous node rows (GPU rows go with them through the cascading
//! foreign key), then inserts the current node and GPU rows. All of it runs in
//! one transaction, so readers see either the old rows or the new ones.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Transaction};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::codec;
use crate::config::{ExternalDbConfig, TableNames};
use crate::error::{DecodeError, Result, StatsError, StoreError};
use crate::mapper;
use crate::pool::{self, Db, DbPool};
use crate::schema::check_tables;
use crate::types::{GpuMetric, JobKey, JobNode, JobSummary, NormalizedJob, StatsPayload};

/// Bound parameters per statement (SQLite's historical limit, well under MySQL's).
const MAX_BIND_PARAMS: usize = 999;

const NODE_COLUMNS: usize = 6;
const GPU_COLUMNS: usize = 5;

#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: DbPool,
    tables: TableNames,
}

/// Everything stored for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredJob {
    /// Surrogate id of the summary row
    pub id: i64,
    pub summary: JobSummary,
    /// In insertion order
    pub nodes: Vec<JobNode>,
    /// `gpus[i]` belongs to `nodes[i]`
    pub gpus: Vec<Vec<GpuMetric>>,
}

impl StoredJob {
    /// Rebuild the summary from the stored rows.
    ///
    /// Rows written without node data fall back to the retained blob, which
    /// also covers marker blobs and summaries stored before normalization.
    pub fn payload(&self) -> std::result::Result<StatsPayload, DecodeError> {
        if self.nodes.is_empty() {
            if let Some(blob) = self.summary.admin_comment.as_deref() {
                if codec::is_stats_blob(blob) {
                    return codec::decode(blob);
                }
            }
        }
        Ok(StatsPayload::Stats(mapper::denormalize(
            &self.summary,
            &self.nodes,
            &self.gpus,
        )))
    }
}

#[derive(FromRow)]
struct SummaryRow {
    id: i64,
    cluster: String,
    jobid: i64,
    admin_comment: Option<String>,
    total_time: Option<i64>,
    gpus: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SummaryRow> for JobSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            cluster: row.cluster,
            job_id: row.jobid,
            admin_comment: row.admin_comment,
            total_time: row.total_time,
            gpu_count: row.gpus,
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
        }
    }
}

#[derive(FromRow)]
struct NodeRow {
    id: i64,
    node_name: String,
    cpus: Option<i64>,
    total_memory: Option<i64>,
    used_memory: Option<i64>,
    total_time: Option<f64>,
}

#[derive(FromRow)]
struct GpuRow {
    job_node_id: i64,
    gpu_index: String,
    gpu_utilization: Option<f64>,
    gpu_used_memory: Option<i64>,
    gpu_total_memory: Option<i64>,
}

const SUMMARY_COLUMNS: &str =
    "id, cluster, jobid, admin_comment, total_time, gpus, created_at, updated_at";

impl RelationalStore {
    /// Wrap a pool. Table names must be plain identifiers.
    pub fn new(pool: DbPool, tables: TableNames) -> Result<Self> {
        check_tables(&tables)?;
        Ok(Self { pool, tables })
    }

    /// Connect to the external database.
    pub async fn connect(config: &ExternalDbConfig) -> Result<Self> {
        check_tables(&config.tables)?;
        let pool = pool::connect(&config.connection).await?;
        Self::new(pool, config.tables.clone())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replace everything stored for the job with `job`.
    pub async fn write(&self, job: &NormalizedJob) -> Result<()> {
        mapper::validate(job)?;
        let key = job.key();

        let span = debug_span!(
            "db.write",
            backend = "relational",
            cluster = %key.cluster,
            job_id = key.job_id,
            duration_ms = tracing::field::Empty
        );
        let start = Instant::now();
        let result = self.write_in_transaction(job).instrument(span.clone()).await;
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        result
    }

    async fn write_in_transaction(&self, job: &NormalizedJob) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        match self.write_rows(&mut tx, job).await {
            Ok(summary_id) => {
                tx.commit().await?;
                debug!(
                    job = %job.key(),
                    summary_id,
                    nodes = job.nodes.len(),
                    gpus = job.gpus.iter().map(Vec::len).sum::<usize>(),
                    "Stored job rows"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(job = %job.key(), error = %e, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn write_rows(
        &self,
        tx: &mut Transaction<'static, Db>,
        job: &NormalizedJob,
    ) -> Result<i64> {
        let summary = &job.summary;

        sqlx::query(&upsert_summary_sql(&self.tables.summary))
            .bind(summary.cluster.as_str())
            .bind(summary.job_id)
            .bind(summary.admin_comment.as_deref())
            .bind(summary.total_time)
            .bind(summary.gpu_count)
            .execute(&mut **tx)
            .await?;

        let summary_id: i64 = sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE cluster = ? AND jobid = ?",
            self.tables.summary
        ))
        .bind(summary.cluster.as_str())
        .bind(summary.job_id)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE job_summary_id = ?",
            self.tables.nodes
        ))
        .bind(summary_id)
        .execute(&mut **tx)
        .await?;

        if job.nodes.is_empty() {
            return Ok(summary_id);
        }

        for chunk in job.nodes.chunks(MAX_BIND_PARAMS / NODE_COLUMNS) {
            let mut builder: QueryBuilder<'_, Db> = QueryBuilder::new(format!(
                "INSERT INTO {} \
                 (job_summary_id, node_name, cpus, total_memory, used_memory, total_time) ",
                self.tables.nodes
            ));
            builder.push_values(chunk, |mut row, node| {
                row.push_bind(summary_id)
                    .push_bind(node.node_name.as_str())
                    .push_bind(node.cpu_count)
                    .push_bind(node.total_memory_bytes)
                    .push_bind(node.used_memory_bytes)
                    .push_bind(node.total_time_seconds);
            });
            builder.build().execute(&mut **tx).await?;
        }

        let node_ids: HashMap<String, i64> = sqlx::query_as::<_, (i64, String)>(&format!(
            "SELECT id, node_name FROM {} WHERE job_summary_id = ?",
            self.tables.nodes
        ))
        .bind(summary_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|(id, name)| (name, id))
        .collect();

        let mut gpu_rows: Vec<(i64, &GpuMetric)> = Vec::new();
        for (node, gpus) in job.nodes_with_gpus() {
            let node_id = *node_ids.get(&node.node_name).ok_or_else(|| {
                StoreError::constraint(format!(
                    "{}: node {} missing after insert",
                    job.key(),
                    node.node_name
                ))
            })?;
            gpu_rows.extend(gpus.iter().map(|gpu| (node_id, gpu)));
        }

        for chunk in gpu_rows.chunks(MAX_BIND_PARAMS / GPU_COLUMNS) {
            let mut builder: QueryBuilder<'_, Db> = QueryBuilder::new(format!(
                "INSERT INTO {} \
                 (job_node_id, gpu_index, gpu_utilization, gpu_used_memory, gpu_total_memory) ",
                self.tables.gpu_metrics
            ));
            builder.push_values(chunk, |mut row, (node_id, gpu)| {
                row.push_bind(*node_id)
                    .push_bind(gpu.gpu_index.as_str())
                    .push_bind(gpu.utilization_percent)
                    .push_bind(gpu.used_memory_bytes)
                    .push_bind(gpu.total_memory_bytes);
            });
            builder.build().execute(&mut **tx).await?;
        }

        Ok(summary_id)
    }

    /// Delete everything stored for a job. Returns whether it existed.
    pub async fn delete(&self, key: &JobKey) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE cluster = ? AND jobid = ?",
            self.tables.summary
        ))
        .bind(key.cluster.as_str())
        .bind(key.job_id)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(job = %key, "Deleted job statistics");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Decoded summary for a job.
    pub async fn read(
        &self,
        key: &JobKey,
    ) -> std::result::Result<Option<StatsPayload>, StatsError> {
        match self.read_rows(key).await? {
            Some(stored) => Ok(Some(stored.payload()?)),
            None => Ok(None),
        }
    }

    /// Retained blob of the newest summary row for a job.
    pub async fn read_blob(&self, key: &JobKey) -> Result<Option<String>> {
        let comment: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT admin_comment FROM {} WHERE cluster = ? AND jobid = ? \
             ORDER BY updated_at DESC LIMIT 1",
            self.tables.summary
        ))
        .bind(key.cluster.as_str())
        .bind(key.job_id)
        .fetch_optional(&self.pool)
        .instrument(debug_span!(
            "db.read",
            backend = "relational",
            cluster = %key.cluster,
            job_id = key.job_id
        ))
        .await?;

        Ok(comment.flatten().filter(|c| !c.trim().is_empty()))
    }

    /// All rows stored for a job, read from one snapshot.
    pub async fn read_rows(&self, key: &JobKey) -> Result<Option<StoredJob>> {
        let span = debug_span!(
            "db.read",
            backend = "relational",
            cluster = %key.cluster,
            job_id = key.job_id,
            duration_ms = tracing::field::Empty
        );
        let start = Instant::now();
        let result = self.read_in_transaction(key).instrument(span.clone()).await;
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        result
    }

    async fn read_in_transaction(&self, key: &JobKey) -> Result<Option<StoredJob>> {
        let mut tx = self.pool.begin().await?;

        let summary: Option<SummaryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE cluster = ? AND jobid = ? ORDER BY updated_at DESC LIMIT 1",
            SUMMARY_COLUMNS, self.tables.summary
        ))
        .bind(key.cluster.as_str())
        .bind(key.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(summary) = summary else {
            tx.commit().await?;
            return Ok(None);
        };
        let summary_id = summary.id;

        let node_rows: Vec<NodeRow> = sqlx::query_as(&format!(
            "SELECT id, node_name, cpus, total_memory, used_memory, total_time \
             FROM {} WHERE job_summary_id = ? ORDER BY id",
            self.tables.nodes
        ))
        .bind(summary_id)
        .fetch_all(&mut *tx)
        .await?;

        let gpu_rows: Vec<GpuRow> = if node_rows.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as(&format!(
                "SELECT g.job_node_id, g.gpu_index, g.gpu_utilization, \
                 g.gpu_used_memory, g.gpu_total_memory \
                 FROM {} g JOIN {} n ON n.id = g.job_node_id \
                 WHERE n.job_summary_id = ? ORDER BY g.id",
                self.tables.gpu_metrics, self.tables.nodes
            ))
            .bind(summary_id)
            .fetch_all(&mut *tx)
            .await?
        };

        tx.commit().await?;

        let mut gpus_by_node: HashMap<i64, Vec<GpuMetric>> = HashMap::new();
        for row in gpu_rows {
            gpus_by_node.entry(row.job_node_id).or_default().push(GpuMetric {
                gpu_index: row.gpu_index,
                utilization_percent: row.gpu_utilization,
                used_memory_bytes: row.gpu_used_memory,
                total_memory_bytes: row.gpu_total_memory,
            });
        }

        let mut nodes = Vec::with_capacity(node_rows.len());
        let mut gpus = Vec::with_capacity(node_rows.len());
        for row in node_rows {
            gpus.push(gpus_by_node.remove(&row.id).unwrap_or_default());
            nodes.push(JobNode {
                node_name: row.node_name,
                cpu_count: row.cpus,
                total_memory_bytes: row.total_memory,
                used_memory_bytes: row.used_memory,
                total_time_seconds: row.total_time,
            });
        }

        Ok(Some(StoredJob {
            id: summary_id,
            summary: summary.into(),
            nodes,
            gpus,
        }))
    }

    /// Most recently updated summaries, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<JobSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} ORDER BY updated_at DESC, id DESC LIMIT ?",
            SUMMARY_COLUMNS, self.tables.summary
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(JobSummary::from).collect())
    }
}

/// Insert-or-update of the summary row. `updated_at` is refreshed on every
/// write; `created_at` keeps the value from the first one.
#[cfg(feature = "sqlite")]
fn upsert_summary_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (cluster, jobid, admin_comment, total_time, gpus, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP) \
         ON CONFLICT(cluster, jobid) DO UPDATE SET \
         admin_comment = excluded.admin_comment, \
         total_time = excluded.total_time, \
         gpus = excluded.gpus, \
         updated_at = CURRENT_TIMESTAMP",
        table
    )
}

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
fn upsert_summary_sql(table: &str) -> String {
    format!(
        "INSERT INTO {} (cluster, jobid, admin_comment, total_time, gpus, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, NOW(), NOW()) \
         ON DUPLICATE KEY UPDATE \
         admin_comment = VALUES(admin_comment), \
         total_time = VALUES(total_time), \
         gpus = VALUES(gpus), \
         updated_at = NOW()",
        table
    )
}
