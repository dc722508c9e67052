//! Relational schema for job statistics.
//!
//! All CREATE TABLE statements live here - single source of truth.

use tracing::info;

use crate::config::TableNames;
use crate::error::{Result, StoreError};
use crate::store::RelationalStore;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Check that a name is safe to splice into SQL as a table name.
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::constraint(format!(
            "{:?} is not a valid table or cluster name",
            name
        )))
    }
}

pub(crate) fn check_tables(tables: &TableNames) -> Result<()> {
    check_identifier(&tables.summary)?;
    check_identifier(&tables.nodes)?;
    check_identifier(&tables.gpu_metrics)
}

impl RelationalStore {
    /// Ensure all tables exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in create_statements(self.tables()) {
            sqlx::query(&statement).execute(self.pool()).await?;
        }

        info!(
            summary = %self.tables().summary,
            nodes = %self.tables().nodes,
            gpu_metrics = %self.tables().gpu_metrics,
            "Job stats schema verified"
        );
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
fn create_statements(t: &TableNames) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {summary} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster TEXT NOT NULL,
                jobid INTEGER NOT NULL,
                admin_comment TEXT,
                total_time INTEGER CHECK (total_time IS NULL OR total_time >= 0),
                gpus INTEGER CHECK (gpus IS NULL OR gpus >= 0),
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(cluster, jobid)
            )"#,
            summary = t.summary
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{summary}_updated_at ON {summary}(updated_at DESC)",
            summary = t.summary
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {nodes} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_summary_id INTEGER NOT NULL REFERENCES {summary}(id) ON DELETE CASCADE,
                node_name TEXT NOT NULL CHECK (length(node_name) > 0),
                cpus INTEGER CHECK (cpus IS NULL OR cpus >= 0),
                total_memory INTEGER CHECK (total_memory IS NULL OR total_memory >= 0),
                used_memory INTEGER CHECK (used_memory IS NULL OR used_memory >= 0),
                total_time REAL CHECK (total_time IS NULL OR total_time >= 0),
                UNIQUE(job_summary_id, node_name)
            )"#,
            nodes = t.nodes,
            summary = t.summary
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {gpu} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_node_id INTEGER NOT NULL REFERENCES {nodes}(id) ON DELETE CASCADE,
                gpu_index TEXT NOT NULL,
                gpu_utilization REAL CHECK (
                    gpu_utilization IS NULL OR (gpu_utilization >= 0 AND gpu_utilization <= 100)
                ),
                gpu_used_memory INTEGER CHECK (gpu_used_memory IS NULL OR gpu_used_memory >= 0),
                gpu_total_memory INTEGER CHECK (gpu_total_memory IS NULL OR gpu_total_memory >= 0),
                UNIQUE(job_node_id, gpu_index)
            )"#,
            gpu = t.gpu_metrics,
            nodes = t.nodes
        ),
    ]
}

#[cfg(all(feature = "mysql", not(feature = "sqlite")))]
fn create_statements(t: &TableNames) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {summary} (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                cluster VARCHAR(64) NOT NULL,
                jobid BIGINT NOT NULL,
                admin_comment TEXT NULL,
                total_time BIGINT NULL CHECK (total_time IS NULL OR total_time >= 0),
                gpus INT NULL CHECK (gpus IS NULL OR gpus >= 0),
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                UNIQUE KEY uniq_cluster_jobid (cluster, jobid),
                KEY idx_updated_at (updated_at)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
            summary = t.summary
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {nodes} (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                job_summary_id BIGINT NOT NULL,
                node_name VARCHAR(255) NOT NULL CHECK (CHAR_LENGTH(node_name) > 0),
                cpus INT NULL CHECK (cpus IS NULL OR cpus >= 0),
                total_memory BIGINT NULL CHECK (total_memory IS NULL OR total_memory >= 0),
                used_memory BIGINT NULL CHECK (used_memory IS NULL OR used_memory >= 0),
                total_time DOUBLE NULL CHECK (total_time IS NULL OR total_time >= 0),
                UNIQUE KEY uniq_job_node (job_summary_id, node_name),
                CONSTRAINT fk_{nodes}_summary FOREIGN KEY (job_summary_id)
                    REFERENCES {summary}(id) ON DELETE CASCADE
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
            nodes = t.nodes,
            summary = t.summary
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {gpu} (
                id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                job_node_id BIGINT NOT NULL,
                gpu_index VARCHAR(64) NOT NULL,
                gpu_utilization DOUBLE NULL CHECK (
                    gpu_utilization IS NULL OR (gpu_utilization >= 0 AND gpu_utilization <= 100)
                ),
                gpu_used_memory BIGINT NULL CHECK (gpu_used_memory IS NULL OR gpu_used_memory >= 0),
                gpu_total_memory BIGINT NULL CHECK (gpu_total_memory IS NULL OR gpu_total_memory >= 0),
                UNIQUE KEY uniq_node_gpu (job_node_id, gpu_index),
                CONSTRAINT fk_{gpu}_node FOREIGN KEY (job_node_id)
                    REFERENCES {nodes}(id) ON DELETE CASCADE
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"#,
            gpu = t.gpu_metrics,
            nodes = t.nodes
        ),
    ]
}
