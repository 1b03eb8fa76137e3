//! Stage executors and the module verifier.
//!
//! Build, test, security scan, and validation are external steps. The
//! engine only sequences them and reads their outcomes.

use std::sync::Arc;

use async_trait::async_trait;

use shipgate_core::{DeploymentRequest, ModuleDescriptor};

/// What a stage executor reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageOutcome {
    pub succeeded: bool,
    pub message: String,
    /// Build output handed to the verifier during the security scan.
    pub artifact: Option<Vec<u8>>,
}

impl StageOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
            artifact: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, artifact: Vec<u8>) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// Runs one pipeline step for a request.
///
/// An `Err` is a fault in the executor itself and fails the stage the same
/// way a non-success outcome does.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run(&self, request: &DeploymentRequest) -> anyhow::Result<StageOutcome>;
}

/// Result of verifying a built module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerificationReport {
    pub valid: bool,
    pub messages: Vec<String>,
}

/// Checks a build artifact before it is allowed anywhere near a cluster.
#[async_trait]
pub trait ModuleVerifier: Send + Sync {
    async fn validate(
        &self,
        module: &ModuleDescriptor,
        artifact: &[u8],
    ) -> anyhow::Result<VerificationReport>;
}

/// The four non-deploy stages of a pipeline.
#[derive(Clone)]
pub struct StageSet {
    pub build: Arc<dyn StageExecutor>,
    pub test: Arc<dyn StageExecutor>,
    pub security_scan: Arc<dyn StageExecutor>,
    pub validation: Arc<dyn StageExecutor>,
}

impl StageSet {
    /// Use one executor for every stage.
    pub fn uniform(executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            build: executor.clone(),
            test: executor.clone(),
            security_scan: executor.clone(),
            validation: executor,
        }
    }
}
