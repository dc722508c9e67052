//! Stats blob codec.
//!
//! Format version 1: `"JS1:" + base64(gzip(json))`, standard alphabet with padding.
//! The JSON document keys nodes by name and GPUs by index:
//!
//! ```text
//! {"total_time": 3600, "gpus": 1,
//!  "nodes": {"n1": {"cpus": 4, "total_memory": 8589934592, "used_memory": 1073741824,
//!                   "total_time": 14200.5,
//!                   "gpu_utilization": {"0": 85.5},
//!                   "gpu_used_memory": {"0": 2147483648},
//!                   "gpu_total_memory": {"0": 17179869184}}}}
//! ```
//!
//! Object order carries node and GPU order. `JS1:Short` and `JS1:None` are marker
//! blobs with no document.

use crate::error::{DecodeError, EncodeError};
use crate::types::{GpuStats, JobStats, NodeStats, StatsPayload};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::marker::PhantomData;

/// Prefix of every version-1 blob.
pub const BLOB_PREFIX: &str = "JS1:";

/// Marker for jobs too short to sample.
pub const SHORT_MARKER: &str = "JS1:Short";

/// Marker for jobs without collected statistics.
pub const NONE_MARKER: &str = "JS1:None";

/// Whether free text looks like a stats blob (as opposed to an unrelated comment).
pub fn is_stats_blob(text: &str) -> bool {
    text.trim_start().starts_with(BLOB_PREFIX)
}

/// Encode a payload into its blob form.
pub fn encode(payload: &StatsPayload) -> Result<String, EncodeError> {
    let stats = match payload {
        StatsPayload::Stats(stats) => stats,
        StatsPayload::TooShort => return Ok(SHORT_MARKER.to_string()),
        StatsPayload::NoData => return Ok(NONE_MARKER.to_string()),
    };

    let json = serde_json::to_vec(&WireJobRef::from(stats))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    Ok(format!("{}{}", BLOB_PREFIX, STANDARD.encode(compressed)))
}

/// Decode a blob.
///
/// Accepts blobs written by the inline store, retained in the summary table, or
/// stored in the legacy single-table layout; they share one format.
pub fn decode(blob: &str) -> Result<StatsPayload, DecodeError> {
    let blob = blob.trim();
    match blob {
        SHORT_MARKER => return Ok(StatsPayload::TooShort),
        NONE_MARKER => return Ok(StatsPayload::NoData),
        _ => {}
    }

    let payload = blob
        .strip_prefix(BLOB_PREFIX)
        .ok_or_else(|| DecodeError::malformed(format!("missing {} prefix", BLOB_PREFIX)))?;
    if payload.is_empty() {
        return Err(DecodeError::truncated("empty payload"));
    }

    let compressed = STANDARD.decode(payload).map_err(|e| match e {
        base64::DecodeError::InvalidByte(offset, byte) => DecodeError::malformed(format!(
            "invalid base64 byte 0x{:02x} at offset {}",
            byte, offset
        )),
        other => DecodeError::truncated(format!("incomplete base64 payload: {}", other)),
    })?;

    let json = gunzip(&compressed)?;

    let wire: WireJob = serde_json::from_slice(&json).map_err(|e| {
        if e.is_eof() {
            DecodeError::truncated(format!("document ends early: {}", e))
        } else {
            DecodeError::malformed(format!("invalid document: {}", e))
        }
    })?;

    Ok(StatsPayload::Stats(wire.into_stats()))
}

fn gunzip(compressed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            DecodeError::truncated(format!("compressed stream ends early: {}", e))
        }
        _ => DecodeError::malformed(format!("corrupt compressed stream: {}", e)),
    })?;
    Ok(out)
}

// ============================================================================
// Wire document (write side)
// ============================================================================

#[derive(Serialize)]
struct WireJobRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    total_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gpus: Option<i64>,
    nodes: WireNodesRef<'a>,
}

impl<'a> From<&'a JobStats> for WireJobRef<'a> {
    fn from(stats: &'a JobStats) -> Self {
        Self {
            total_time: stats.total_time,
            gpus: stats.gpus,
            nodes: WireNodesRef(&stats.nodes),
        }
    }
}

struct WireNodesRef<'a>(&'a [NodeStats]);

impl Serialize for WireNodesRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for node in self.0 {
            map.serialize_entry(&node.name, &WireNodeRef(node))?;
        }
        map.end()
    }
}

struct WireNodeRef<'a>(&'a NodeStats);

impl Serialize for WireNodeRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let node = self.0;
        let mut map = serializer.serialize_map(None)?;
        if let Some(cpus) = node.cpus {
            map.serialize_entry("cpus", &cpus)?;
        }
        if let Some(total) = node.total_memory {
            map.serialize_entry("total_memory", &total)?;
        }
        if let Some(used) = node.used_memory {
            map.serialize_entry("used_memory", &used)?;
        }
        if let Some(time) = node.total_time {
            map.serialize_entry("total_time", &time)?;
        }
        if !node.gpus.is_empty() {
            // Every GPU appears in the utilization map (null when unknown) so a GPU
            // with no readings still survives a round trip.
            map.serialize_entry("gpu_utilization", &GpuUtilizationRef(&node.gpus))?;
            if node.gpus.iter().any(|g| g.used_memory.is_some()) {
                map.serialize_entry(
                    "gpu_used_memory",
                    &GpuMemoryRef(&node.gpus, |g| g.used_memory),
                )?;
            }
            if node.gpus.iter().any(|g| g.total_memory.is_some()) {
                map.serialize_entry(
                    "gpu_total_memory",
                    &GpuMemoryRef(&node.gpus, |g| g.total_memory),
                )?;
            }
        }
        map.end()
    }
}

struct GpuUtilizationRef<'a>(&'a [GpuStats]);

impl Serialize for GpuUtilizationRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for gpu in self.0 {
            map.serialize_entry(&gpu.index, &gpu.utilization)?;
        }
        map.end()
    }
}

struct GpuMemoryRef<'a>(&'a [GpuStats], fn(&GpuStats) -> Option<i64>);

impl Serialize for GpuMemoryRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for gpu in self.0 {
            if let Some(bytes) = (self.1)(gpu) {
                map.serialize_entry(&gpu.index, &bytes)?;
            }
        }
        map.end()
    }
}

// ============================================================================
// Wire document (read side)
// ============================================================================

#[derive(Deserialize)]
struct WireJob {
    #[serde(default)]
    total_time: Option<i64>,
    #[serde(default)]
    gpus: Option<i64>,
    #[serde(default)]
    nodes: Option<OrderedMap<WireNode>>,
}

impl WireJob {
    fn into_stats(self) -> JobStats {
        JobStats {
            total_time: self.total_time,
            gpus: self.gpus,
            nodes: self
                .nodes
                .unwrap_or_default()
                .0
                .into_iter()
                .map(|(name, node)| node.into_stats(name))
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct WireNode {
    #[serde(default)]
    cpus: Option<i64>,
    #[serde(default)]
    total_memory: Option<i64>,
    #[serde(default)]
    used_memory: Option<i64>,
    #[serde(default)]
    total_time: Option<f64>,
    #[serde(default)]
    gpu_utilization: Option<OrderedMap<Option<f64>>>,
    #[serde(default)]
    gpu_used_memory: Option<OrderedMap<Option<i64>>>,
    #[serde(default)]
    gpu_total_memory: Option<OrderedMap<Option<i64>>>,
}

impl WireNode {
    fn into_stats(self, name: String) -> NodeStats {
        let utilization = self.gpu_utilization.unwrap_or_default();
        let used = self.gpu_used_memory.unwrap_or_default();
        let total = self.gpu_total_memory.unwrap_or_default();

        // GPU order: first appearance across the three maps.
        let mut indexes: Vec<&str> = Vec::new();
        for key in utilization.keys().chain(used.keys()).chain(total.keys()) {
            if !indexes.contains(&key) {
                indexes.push(key);
            }
        }

        let gpus = indexes
            .iter()
            .map(|index| GpuStats {
                index: (*index).to_string(),
                utilization: utilization.get(index).flatten(),
                used_memory: used.get(index).flatten(),
                total_memory: total.get(index).flatten(),
            })
            .collect();

        NodeStats {
            name,
            cpus: self.cpus,
            total_memory: self.total_memory,
            used_memory: self.used_memory,
            total_time: self.total_time,
            gpus,
        }
    }
}

/// JSON object decoded with its key order intact. Repeated keys keep the last value.
struct OrderedMap<V>(Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V: Copy> OrderedMap<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}

impl<V> OrderedMap<V> {
    fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, V)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    match entries.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => slot.1 = value,
                        None => entries.push((key, value)),
                    }
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}
