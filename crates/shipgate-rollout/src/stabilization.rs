//! Metric-driven stabilization — wait until a rollout has settled.
//!
//! Instead of sleeping a fixed time after a deploy, the monitor polls the
//! target nodes and compares their average CPU, memory, and latency against
//! a baseline taken before the deploy. A poll is stable when all three
//! deltas are inside their thresholds. The rollout is declared stable once
//! enough consecutive polls are stable *and* the minimum wait has elapsed;
//! it times out at the maximum wait.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shipgate_core::{CancelSignal, ConfigError, NodeId, StabilizationSettings};

use crate::metrics::{ClusterMetricsSnapshot, MetricsProvider};

/// Errors that abort a stabilization wait.
#[derive(Debug, Error)]
pub enum StabilizationError {
    #[error("stabilization wait cancelled")]
    Cancelled,

    #[error("metrics provider failed: {0}")]
    Metrics(#[from] anyhow::Error),
}

pub type StabilizationResult<T> = Result<T, StabilizationError>;

/// Thresholds and timing for one stabilization wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStabilizationConfig {
    /// Allowed CPU drift from baseline, in percent of baseline.
    pub cpu_threshold_percent: f64,
    pub memory_threshold_percent: f64,
    pub latency_threshold_percent: f64,
    pub polling_interval: Duration,
    /// Back-to-back stable polls needed.
    pub required_consecutive_checks: u32,
    /// Never declare stability before this much time has passed.
    pub minimum_wait: Duration,
    /// Give up once this much time has passed.
    pub maximum_wait: Duration,
}

impl Default for ResourceStabilizationConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 10.0,
            memory_threshold_percent: 10.0,
            latency_threshold_percent: 10.0,
            polling_interval: Duration::from_secs(30),
            required_consecutive_checks: 3,
            minimum_wait: Duration::from_secs(120),
            maximum_wait: Duration::from_secs(900),
        }
    }
}

impl TryFrom<&StabilizationSettings> for ResourceStabilizationConfig {
    type Error = ConfigError;

    fn try_from(s: &StabilizationSettings) -> Result<Self, Self::Error> {
        Ok(Self {
            cpu_threshold_percent: s.cpu_threshold_percent,
            memory_threshold_percent: s.memory_threshold_percent,
            latency_threshold_percent: s.latency_threshold_percent,
            polling_interval: s.polling_interval()?,
            required_consecutive_checks: s.required_consecutive_checks,
            minimum_wait: s.minimum_wait()?,
            maximum_wait: s.maximum_wait()?,
        })
    }
}

/// Final verdict of a stabilization wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStabilizationResult {
    pub is_stable: bool,
    pub timeout_reached: bool,
    pub consecutive_stable_checks: u32,
    pub total_checks: u32,
    pub elapsed: Duration,
    /// Averages observed on the last poll, if any poll returned data.
    pub last_metrics: Option<ClusterMetricsSnapshot>,
    pub message: String,
}

/// Absolute percentage deltas of one poll against the baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricDeltas {
    pub cpu: f64,
    pub memory: f64,
    pub latency: f64,
}

impl MetricDeltas {
    pub fn between(baseline: &ClusterMetricsSnapshot, current: &ClusterMetricsSnapshot) -> Self {
        Self {
            cpu: percent_delta(current.avg_cpu_percent, baseline.avg_cpu_percent),
            memory: percent_delta(current.avg_memory_percent, baseline.avg_memory_percent),
            latency: percent_delta(current.avg_latency_ms, baseline.avg_latency_ms),
        }
    }

    /// All three deltas inside their thresholds.
    pub fn within(&self, config: &ResourceStabilizationConfig) -> bool {
        self.cpu <= config.cpu_threshold_percent
            && self.memory <= config.memory_threshold_percent
            && self.latency <= config.latency_threshold_percent
    }
}

/// `|current - baseline| / baseline * 100`.
///
/// A zero baseline only tolerates a zero reading.
pub fn percent_delta(current: f64, baseline: f64) -> f64 {
    if baseline == 0.0 {
        return if current == 0.0 { 0.0 } else { f64::INFINITY };
    }
    ((current - baseline) / baseline).abs() * 100.0
}

/// Counts back-to-back stable polls.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    consecutive: u32,
    total: u32,
}

impl StabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one poll and return the consecutive-stable count.
    ///
    /// Any unstable poll resets the count to zero.
    pub fn record(&mut self, stable: bool) -> u32 {
        self.total += 1;
        if stable {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.consecutive
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

/// Polls a metrics provider until the nodes settle, time out, or the wait is cancelled.
#[derive(Clone)]
pub struct StabilizationMonitor {
    provider: Arc<dyn MetricsProvider>,
}

impl StabilizationMonitor {
    pub fn new(provider: Arc<dyn MetricsProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn MetricsProvider> {
        &self.provider
    }

    /// Wait for `node_ids` to stabilize around `baseline`.
    ///
    /// Cancellation is checked before every poll and interrupts the
    /// inter-poll delay; it surfaces as `StabilizationError::Cancelled`.
    pub async fn wait_for_stabilization(
        &self,
        node_ids: &[NodeId],
        baseline: &ClusterMetricsSnapshot,
        config: &ResourceStabilizationConfig,
        cancel: &CancelSignal,
    ) -> StabilizationResult<ResourceStabilizationResult> {
        let started = Instant::now();
        let mut tracker = StabilityTracker::new();
        let mut last_metrics = None;

        info!(
            nodes = node_ids.len(),
            required = config.required_consecutive_checks,
            min_wait = ?config.minimum_wait,
            max_wait = ?config.maximum_wait,
            "waiting for stabilization"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(StabilizationError::Cancelled);
            }

            let elapsed = started.elapsed();
            if elapsed >= config.maximum_wait {
                return Ok(timed_out(&tracker, elapsed, last_metrics, config));
            }

            let samples = self.provider.get_node_metrics(node_ids).await?;
            let stable = match ClusterMetricsSnapshot::average(&samples) {
                Some(current) => {
                    let deltas = MetricDeltas::between(baseline, &current);
                    let stable = deltas.within(config);
                    debug!(
                        cpu_delta = deltas.cpu,
                        memory_delta = deltas.memory,
                        latency_delta = deltas.latency,
                        stable,
                        "stabilization poll"
                    );
                    last_metrics = Some(current);
                    stable
                }
                None => {
                    warn!(nodes = node_ids.len(), "no metrics returned, counting poll as unstable");
                    false
                }
            };
            let consecutive = tracker.record(stable);

            // A poll that returns after the ceiling never counts toward success.
            let elapsed = started.elapsed();
            if elapsed >= config.maximum_wait {
                return Ok(timed_out(&tracker, elapsed, last_metrics, config));
            }
            if consecutive >= config.required_consecutive_checks && elapsed >= config.minimum_wait {
                info!(consecutive, checks = tracker.total(), ?elapsed, "nodes stabilized");
                return Ok(ResourceStabilizationResult {
                    is_stable: true,
                    timeout_reached: false,
                    consecutive_stable_checks: consecutive,
                    total_checks: tracker.total(),
                    elapsed,
                    last_metrics,
                    message: format!("stable after {consecutive} consecutive checks in {elapsed:?}"),
                });
            }

            let delay = config
                .polling_interval
                .min(config.maximum_wait.saturating_sub(elapsed));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(StabilizationError::Cancelled),
            }
        }
    }
}

fn timed_out(
    tracker: &StabilityTracker,
    elapsed: Duration,
    last_metrics: Option<ClusterMetricsSnapshot>,
    config: &ResourceStabilizationConfig,
) -> ResourceStabilizationResult {
    warn!(
        consecutive = tracker.consecutive(),
        checks = tracker.total(),
        ?elapsed,
        "stabilization timed out"
    );
    ResourceStabilizationResult {
        is_stable: false,
        timeout_reached: true,
        consecutive_stable_checks: tracker.consecutive(),
        total_checks: tracker.total(),
        elapsed,
        last_metrics,
        message: format!(
            "not stable after {:?} ({} of {} consecutive stable checks)",
            elapsed,
            tracker.consecutive(),
            config.required_consecutive_checks
        ),
    }
}
