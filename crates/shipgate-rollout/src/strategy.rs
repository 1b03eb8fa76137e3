//! Deployment strategies and cluster lookup.
//!
//! A strategy pushes one module onto the nodes of one cluster and reports
//! per-node results. How nodes are picked and how traffic moves is the
//! strategy's business; Shipgate only reads the outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shipgate_core::{DeploymentRequest, Environment, NodeId};

/// The cluster backing one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    pub id: String,
    pub environment: Environment,
    pub node_ids: Vec<NodeId>,
}

/// Resolves the cluster an environment deploys onto.
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn get_cluster(&self, environment: Environment) -> anyhow::Result<ClusterHandle>;
}

/// Fixed environment → cluster mapping.
#[derive(Debug, Clone, Default)]
pub struct StaticClusterRegistry {
    clusters: HashMap<Environment, ClusterHandle>,
}

impl StaticClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, cluster: ClusterHandle) -> Self {
        self.clusters.insert(cluster.environment, cluster);
        self
    }
}

#[async_trait]
impl ClusterRegistry for StaticClusterRegistry {
    async fn get_cluster(&self, environment: Environment) -> anyhow::Result<ClusterHandle> {
        self.clusters
            .get(&environment)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no cluster registered for {environment}"))
    }
}

/// Result of deploying to a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeployResult {
    pub node_id: NodeId,
    pub success: bool,
    pub message: String,
}

/// What a strategy reports after a deploy attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub success: bool,
    pub message: String,
    pub node_results: Vec<NodeDeployResult>,
    pub error: Option<String>,
}

impl DeploymentOutcome {
    /// Build an outcome from node results. Succeeds only if every node did.
    pub fn from_nodes(node_results: Vec<NodeDeployResult>) -> Self {
        let failed = node_results.iter().filter(|n| !n.success).count();
        let success = failed == 0;
        let message = if success {
            format!("deployed to {} node(s)", node_results.len())
        } else {
            format!("{failed} of {} node(s) failed", node_results.len())
        };
        Self {
            success,
            message,
            node_results,
            error: None,
        }
    }

    pub fn nodes_succeeded(&self) -> u32 {
        self.node_results.iter().filter(|n| n.success).count() as u32
    }

    pub fn nodes_failed(&self) -> u32 {
        self.node_results.iter().filter(|n| !n.success).count() as u32
    }
}

/// Pushes a module onto a cluster.
#[async_trait]
pub trait DeploymentStrategy: Send + Sync {
    /// Short name recorded on the deploy stage (e.g. "canary").
    fn name(&self) -> &str;

    async fn deploy(
        &self,
        request: &DeploymentRequest,
        cluster: &ClusterHandle,
    ) -> anyhow::Result<DeploymentOutcome>;
}

/// Which strategy deploys each environment.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<Environment, Arc<dyn DeploymentStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy, replacing any previous one for the environment.
    pub fn register(&mut self, environment: Environment, strategy: Arc<dyn DeploymentStrategy>) {
        self.strategies.insert(environment, strategy);
    }

    pub fn with(mut self, environment: Environment, strategy: Arc<dyn DeploymentStrategy>) -> Self {
        self.register(environment, strategy);
        self
    }

    /// Use one strategy for every environment.
    pub fn uniform(strategy: Arc<dyn DeploymentStrategy>) -> Self {
        let mut registry = Self::new();
        for env in Environment::ALL {
            registry.register(env, strategy.clone());
        }
        registry
    }

    pub fn resolve(&self, environment: Environment) -> Option<Arc<dyn DeploymentStrategy>> {
        self.strategies.get(&environment).cloned()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for env in Environment::ALL {
            if let Some(s) = self.strategies.get(&env) {
                map.entry(&env, &s.name());
            }
        }
        map.finish()
    }
}
