//! Job statistics types.
//!
//! `JobStats` is the decoded summary the collector produces. `JobSummary`,
//! `JobNode` and `GpuMetric` are its normalized relational form.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

// ============================================================================
// Decoded summary
// ============================================================================

/// Identity of a job's statistics: unique per `(cluster, job_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub cluster: String,
    pub job_id: i64,
}

impl JobKey {
    pub fn new(cluster: impl Into<String>, job_id: i64) -> Self {
        Self {
            cluster: cluster.into(),
            job_id,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.job_id)
    }
}

/// What a stats blob carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatsPayload {
    /// Collected statistics.
    Stats(JobStats),
    /// The job ended before it could be sampled.
    TooShort,
    /// No statistics were collected for the job.
    NoData,
}

impl StatsPayload {
    pub fn stats(&self) -> Option<&JobStats> {
        match self {
            Self::Stats(stats) => Some(stats),
            Self::TooShort | Self::NoData => None,
        }
    }
}

impl From<JobStats> for StatsPayload {
    fn from(stats: JobStats) -> Self {
        Self::Stats(stats)
    }
}

/// A job's resource usage summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    /// Wall-clock run time in seconds
    pub total_time: Option<i64>,
    /// Number of GPUs allocated to the job
    pub gpus: Option<i64>,
    /// Per-node breakdown, in collector order
    pub nodes: Vec<NodeStats>,
}

/// Usage on one node of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    pub name: String,
    pub cpus: Option<i64>,
    pub total_memory: Option<i64>,
    pub used_memory: Option<i64>,
    /// CPU time in seconds
    pub total_time: Option<f64>,
    pub gpus: Vec<GpuStats>,
}

/// Usage of one GPU on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpuStats {
    /// Device identifier as reported by the collector (not necessarily numeric)
    pub index: String,
    /// Mean utilization percent
    pub utilization: Option<f64>,
    pub used_memory: Option<i64>,
    pub total_memory: Option<i64>,
}

// ============================================================================
// Normalized rows
// ============================================================================

/// One row of the summary table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub cluster: String,
    pub job_id: i64,
    /// Retained stats blob
    pub admin_comment: Option<String>,
    pub total_time: Option<i64>,
    pub gpu_count: Option<i64>,
    /// Assigned by the database
    pub created_at: Option<DateTime<Utc>>,
    /// Assigned by the database, refreshed on every write
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobSummary {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.cluster.clone(), self.job_id)
    }
}

/// One row of the node table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNode {
    pub node_name: String,
    pub cpu_count: Option<i64>,
    pub total_memory_bytes: Option<i64>,
    pub used_memory_bytes: Option<i64>,
    pub total_time_seconds: Option<f64>,
}

/// One row of the GPU metrics table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuMetric {
    pub gpu_index: String,
    pub utilization_percent: Option<f64>,
    pub used_memory_bytes: Option<i64>,
    pub total_memory_bytes: Option<i64>,
}

/// A job decomposed into rows. `gpus[i]` belongs to `nodes[i]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedJob {
    pub summary: JobSummary,
    pub nodes: Vec<JobNode>,
    pub gpus: Vec<Vec<GpuMetric>>,
}

impl NormalizedJob {
    pub fn key(&self) -> JobKey {
        self.summary.key()
    }

    /// Iterate nodes together with their GPU metrics.
    pub fn nodes_with_gpus(&self) -> impl Iterator<Item = (&JobNode, &[GpuMetric])> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node, self.gpus.get(i).map(Vec::as_slice).unwrap_or(&[])))
    }
}

/// Storage mode, fixed at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Blob in the workload manager's own job record
    Inline,
    /// Normalized rows in the external database
    Relational,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Relational => "relational",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
