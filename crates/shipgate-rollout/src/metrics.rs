//! Node metrics source and cluster-wide averages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shipgate_core::NodeId;

/// One node's current resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub latency_ms: f64,
}

/// Source of live node metrics. Collection itself happens elsewhere.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn get_node_metrics(&self, node_ids: &[NodeId]) -> anyhow::Result<Vec<NodeMetrics>>;
}

/// Average metrics across a set of nodes at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetricsSnapshot {
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub avg_latency_ms: f64,
    pub node_count: u32,
}

impl ClusterMetricsSnapshot {
    pub fn new(avg_cpu_percent: f64, avg_memory_percent: f64, avg_latency_ms: f64) -> Self {
        Self {
            avg_cpu_percent,
            avg_memory_percent,
            avg_latency_ms,
            node_count: 0,
        }
    }

    /// Average a set of samples. `None` when there are no samples.
    pub fn average(samples: &[NodeMetrics]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let (cpu, mem, lat) = samples.iter().fold((0.0, 0.0, 0.0), |acc, m| {
            (
                acc.0 + m.cpu_percent,
                acc.1 + m.memory_percent,
                acc.2 + m.latency_ms,
            )
        });
        Some(Self {
            avg_cpu_percent: cpu / n,
            avg_memory_percent: mem / n,
            avg_latency_ms: lat / n,
            node_count: samples.len() as u32,
        })
    }
}

/// Take the baseline averages used by a later stabilization wait.
pub async fn capture_baseline(
    provider: &dyn MetricsProvider,
    node_ids: &[NodeId],
) -> anyhow::Result<ClusterMetricsSnapshot> {
    let samples = provider.get_node_metrics(node_ids).await?;
    ClusterMetricsSnapshot::average(&samples)
        .ok_or_else(|| anyhow::anyhow!("no metrics reported for {} node(s)", node_ids.len()))
}
