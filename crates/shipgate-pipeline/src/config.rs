//! Pipeline engine runtime configuration.

use std::collections::HashMap;

use shipgate_core::{ApprovalMode, ConfigError, Environment, ShipgateConfig};
use shipgate_rollout::ResourceStabilizationConfig;

/// How the engine gates and verifies a promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub approval_mode: ApprovalMode,
    /// Environments that need approval when the request opts in.
    pub approval_environments: Vec<Environment>,
    /// Stabilization waits keyed by environment. Missing means no wait.
    pub stabilization: HashMap<Environment, ResourceStabilizationConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Upfront,
            approval_environments: vec![Environment::Staging, Environment::Production],
            stabilization: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_stabilization(
        mut self,
        environment: Environment,
        config: ResourceStabilizationConfig,
    ) -> Self {
        self.stabilization.insert(environment, config);
        self
    }

    /// Whether deploying `environment` needs sign-off for `request_opted_in`.
    pub fn requires_approval(&self, environment: Environment, request_opted_in: bool) -> bool {
        request_opted_in && self.approval_environments.contains(&environment)
    }

    pub fn stabilization_for(&self, environment: Environment) -> Option<&ResourceStabilizationConfig> {
        self.stabilization.get(&environment)
    }
}

impl TryFrom<&ShipgateConfig> for PipelineConfig {
    type Error = ConfigError;

    fn try_from(config: &ShipgateConfig) -> Result<Self, Self::Error> {
        let stabilization = config
            .stabilization
            .iter()
            .map(|s| Ok((s.environment, ResourceStabilizationConfig::try_from(s)?)))
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;

        Ok(Self {
            approval_mode: config.pipeline.approval_mode,
            approval_environments: config.pipeline.approval_environments.clone(),
            stabilization,
        })
    }
}
