//! Decomposition of a decoded summary into rows, and back.

use std::collections::HashSet;

use crate::error::{Result, StoreError};
use crate::types::{
    GpuMetric, GpuStats, JobKey, JobNode, JobStats, JobSummary, NodeStats, NormalizedJob,
    StatsPayload,
};

/// Decompose a payload into summary, node and GPU rows.
///
/// `blob` is the encoded form of `payload`, retained on the summary row. Marker
/// payloads produce a summary with no scalar values and no nodes.
pub fn normalize(key: &JobKey, payload: &StatsPayload, blob: Option<String>) -> NormalizedJob {
    let empty = JobStats::default();
    let stats = payload.stats().unwrap_or(&empty);

    let summary = JobSummary {
        cluster: key.cluster.clone(),
        job_id: key.job_id,
        admin_comment: blob,
        total_time: stats.total_time,
        gpu_count: stats.gpus,
        created_at: None,
        updated_at: None,
    };

    let nodes = stats.nodes.iter().map(node_row).collect();
    let gpus = stats
        .nodes
        .iter()
        .map(|node| node.gpus.iter().map(gpu_row).collect())
        .collect();

    NormalizedJob {
        summary,
        nodes,
        gpus,
    }
}

/// Rebuild the summary from its rows.
pub fn denormalize(summary: &JobSummary, nodes: &[JobNode], gpus: &[Vec<GpuMetric>]) -> JobStats {
    JobStats {
        total_time: summary.total_time,
        gpus: summary.gpu_count,
        nodes: nodes
            .iter()
            .enumerate()
            .map(|(i, node)| NodeStats {
                name: node.node_name.clone(),
                cpus: node.cpu_count,
                total_memory: node.total_memory_bytes,
                used_memory: node.used_memory_bytes,
                total_time: node.total_time_seconds,
                gpus: gpus
                    .get(i)
                    .map(|metrics| metrics.iter().map(gpu_stats).collect())
                    .unwrap_or_default(),
            })
            .collect(),
    }
}

fn node_row(node: &NodeStats) -> JobNode {
    JobNode {
        node_name: node.name.clone(),
        cpu_count: node.cpus,
        total_memory_bytes: node.total_memory,
        used_memory_bytes: node.used_memory,
        total_time_seconds: node.total_time,
    }
}

fn gpu_row(gpu: &GpuStats) -> GpuMetric {
    GpuMetric {
        gpu_index: gpu.index.clone(),
        utilization_percent: gpu.utilization.map(round_percent),
        used_memory_bytes: gpu.used_memory,
        total_memory_bytes: gpu.total_memory,
    }
}

fn gpu_stats(metric: &GpuMetric) -> GpuStats {
    GpuStats {
        index: metric.gpu_index.clone(),
        utilization: metric.utilization_percent,
        used_memory: metric.used_memory_bytes,
        total_memory: metric.total_memory_bytes,
    }
}

/// Utilization is stored with two decimals.
fn round_percent(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Check a normalized job before any row is written.
pub fn validate(job: &NormalizedJob) -> Result<()> {
    let key = job.key();
    if key.cluster.trim().is_empty() {
        return Err(StoreError::constraint("cluster name is empty"));
    }
    non_negative(&key, "total_time", job.summary.total_time)?;
    non_negative(&key, "gpus", job.summary.gpu_count)?;

    if job.gpus.len() != job.nodes.len() {
        return Err(StoreError::constraint(format!(
            "{}: {} GPU lists for {} nodes",
            key,
            job.gpus.len(),
            job.nodes.len()
        )));
    }

    let mut node_names = HashSet::new();
    for (node, gpus) in job.nodes_with_gpus() {
        let name = node.node_name.as_str();
        if name.trim().is_empty() || name.chars().any(char::is_control) {
            return Err(StoreError::constraint(format!(
                "{}: malformed node name {:?}",
                key, name
            )));
        }
        if !node_names.insert(name) {
            return Err(StoreError::constraint(format!(
                "{}: duplicate node {}",
                key, name
            )));
        }
        non_negative(&key, "cpus", node.cpu_count)?;
        non_negative(&key, "total_memory", node.total_memory_bytes)?;
        non_negative(&key, "used_memory", node.used_memory_bytes)?;
        if let Some(time) = node.total_time_seconds {
            if !time.is_finite() || time < 0.0 {
                return Err(StoreError::constraint(format!(
                    "{}: node {} has invalid total_time {}",
                    key, name, time
                )));
            }
        }

        let mut gpu_indexes = HashSet::new();
        for gpu in gpus {
            if gpu.gpu_index.trim().is_empty() {
                return Err(StoreError::constraint(format!(
                    "{}: node {} has a GPU without an index",
                    key, name
                )));
            }
            if !gpu_indexes.insert(gpu.gpu_index.as_str()) {
                return Err(StoreError::constraint(format!(
                    "{}: node {} lists GPU {} twice",
                    key, name, gpu.gpu_index
                )));
            }
            if let Some(util) = gpu.utilization_percent {
                if !(0.0..=100.0).contains(&util) {
                    return Err(StoreError::constraint(format!(
                        "{}: GPU {} on {} has utilization {} outside 0-100",
                        key, gpu.gpu_index, name, util
                    )));
                }
            }
            non_negative(&key, "gpu_used_memory", gpu.used_memory_bytes)?;
            non_negative(&key, "gpu_total_memory", gpu.total_memory_bytes)?;
        }
    }

    Ok(())
}

fn non_negative(key: &JobKey, field: &str, value: Option<i64>) -> Result<()> {
    match value {
        Some(v) if v < 0 => Err(StoreError::constraint(format!(
            "{}: {} is negative ({})",
            key, field, v
        ))),
        _ => Ok(()),
    }
}
