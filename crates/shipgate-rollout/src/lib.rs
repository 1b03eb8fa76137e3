//! Shipgate rollout plumbing — strategies, clusters, and stabilization.
//!
//! This crate defines the seams the pipeline uses to push a module onto an
//! environment and to decide when that rollout has settled. Concrete
//! strategies (canary, blue-green, rolling) and metric sources live outside
//! Shipgate and plug in through the traits here.
//!
//! # Components
//!
//! - **`strategy`** — `DeploymentStrategy`, `ClusterRegistry`, and the per-environment `StrategyRegistry`
//! - **`metrics`** — `MetricsProvider` and baseline capture
//! - **`stabilization`** — `StabilizationMonitor`, the consecutive-stable polling loop

pub mod metrics;
pub mod stabilization;
pub mod strategy;

pub use metrics::{ClusterMetricsSnapshot, MetricsProvider, NodeMetrics, capture_baseline};
pub use stabilization::{
    MetricDeltas, ResourceStabilizationConfig, ResourceStabilizationResult, StabilizationError,
    StabilizationMonitor, StabilityTracker, percent_delta,
};
pub use strategy::{
    ClusterHandle, ClusterRegistry, DeploymentOutcome, DeploymentStrategy, NodeDeployResult,
    StaticClusterRegistry, StrategyRegistry,
};
