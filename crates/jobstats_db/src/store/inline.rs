//! Inline storage in the workload manager's accounting database.
//!
//! Each cluster keeps its jobs in `<cluster>_job_table`; the blob goes into the
//! `admin_comment` column of the row whose `id_job` matches.

use std::time::Instant;

use tracing::{debug, debug_span, warn, Instrument};

use crate::codec;
use crate::config::ConnectionConfig;
use crate::error::{Result, StatsError, StoreError};
use crate::pool::{self, DbPool};
use crate::schema::check_identifier;
use crate::types::{JobKey, NormalizedJob, StatsPayload};

#[derive(Debug, Clone)]
pub struct InlineStore {
    pool: DbPool,
}

impl InlineStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect to the accounting database.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(pool::connect(config).await?))
    }

    /// Like [`connect`](Self::connect), but the first connection is made on use.
    pub fn connect_lazy(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(pool::connect_lazy(config)?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Store the job's blob in its job record.
    ///
    /// Exactly one record must match the job id; otherwise nothing is changed
    /// and the write fails with `ConstraintViolated`.
    pub async fn write(&self, job: &NormalizedJob) -> Result<()> {
        let key = job.key();
        let blob = job.summary.admin_comment.as_deref().ok_or_else(|| {
            StoreError::constraint(format!("{}: no encoded blob to store inline", key))
        })?;
        let table = job_table(&key.cluster)?;

        let span = debug_span!(
            "db.write",
            backend = "inline",
            cluster = %key.cluster,
            job_id = key.job_id,
            duration_ms = tracing::field::Empty
        );
        let start = Instant::now();
        let result = self
            .update_record(&table, &key, blob)
            .instrument(span.clone())
            .await;
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        result
    }

    async fn update_record(&self, table: &str, key: &JobKey, blob: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE {} SET admin_comment = ? WHERE id_job = ?",
            table
        ))
        .bind(blob)
        .bind(key.job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // MySQL reports changed rows, not matched rows, so rewriting an
        // identical blob reports zero.
        let matched = if updated == 0 {
            let count: i64 =
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE id_job = ?", table))
                    .bind(key.job_id)
                    .fetch_one(&mut *tx)
                    .await?;
            count as u64
        } else {
            updated
        };

        if matched != 1 {
            if let Err(e) = tx.rollback().await {
                warn!(job = %key, error = %e, "Rollback failed");
            }
            return Err(StoreError::constraint(format!(
                "{}: expected exactly one job record, matched {}",
                key, matched
            )));
        }

        tx.commit().await?;
        debug!(job = %key, "Stored blob in job record");
        Ok(())
    }

    /// Raw `admin_comment` of the job record. Blank comments read as absent.
    pub async fn read_blob(&self, key: &JobKey) -> Result<Option<String>> {
        let table = job_table(&key.cluster)?;
        let comment: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT admin_comment FROM {} WHERE id_job = ? LIMIT 1",
            table
        ))
        .bind(key.job_id)
        .fetch_optional(&self.pool)
        .instrument(debug_span!(
            "db.read",
            backend = "inline",
            cluster = %key.cluster,
            job_id = key.job_id
        ))
        .await?;

        Ok(comment.flatten().filter(|c| !c.trim().is_empty()))
    }

    /// Decoded summary for a job.
    ///
    /// An `admin_comment` that is not a stats blob (free text left by an
    /// administrator) reads as absent.
    pub async fn read(
        &self,
        key: &JobKey,
    ) -> std::result::Result<Option<StatsPayload>, StatsError> {
        match self.read_blob(key).await? {
            Some(text) if codec::is_stats_blob(&text) => Ok(Some(codec::decode(&text)?)),
            Some(_) => {
                debug!(job = %key, "Job record comment is not a stats blob");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

fn job_table(cluster: &str) -> Result<String> {
    check_identifier(cluster)?;
    Ok(format!("{}_job_table", cluster))
}
