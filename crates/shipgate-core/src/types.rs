//! Shared types used across Shipgate crates.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier of one deployment attempt, end to end.
pub type ExecutionId = String;

/// Unique identifier for a node in a target cluster.
pub type NodeId = String;

// ── Environment ────────────────────────────────────────────────────

/// Deployment environment. The declaration order is the promotion order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Qa,
    Staging,
    Production,
}

impl Environment {
    /// Every environment, lowest first.
    pub const ALL: [Environment; 4] = [
        Environment::Development,
        Environment::Qa,
        Environment::Staging,
        Environment::Production,
    ];

    /// Environments a module must pass through to reach `self`, in order,
    /// ending with `self`. Always starts at `Development`.
    pub fn promotion_chain(self) -> &'static [Environment] {
        let idx = Self::ALL
            .iter()
            .position(|e| *e == self)
            .unwrap_or(Self::ALL.len() - 1);
        &Self::ALL[..=idx]
    }

    /// Whether the environment is sensitive by default (approval-gated).
    pub fn is_sensitive(self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }

    pub fn label(self) -> &'static str {
        match self {
            Environment::Development => "Development",
            Environment::Qa => "QA",
            Environment::Staging => "Staging",
            Environment::Production => "Production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown environment: {0}")]
pub struct UnknownEnvironment(pub String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "qa" => Ok(Environment::Qa),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(UnknownEnvironment(other.to_string())),
        }
    }
}

// ── Module ─────────────────────────────────────────────────────────

/// Resources a module asks for on each node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceRequirements {
    /// CPU in millicores.
    pub cpu_millicores: u32,
    /// Memory in bytes.
    pub memory_bytes: u64,
}

/// The versioned module being promoted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: semver::Version,
    pub resources: ResourceRequirements,
}

impl ModuleDescriptor {
    pub fn new(name: &str, version: semver::Version) -> Self {
        Self {
            name: name.to_string(),
            version,
            resources: ResourceRequirements::default(),
        }
    }
}

// ── Deployment request ─────────────────────────────────────────────

/// One promotion attempt of a module to a target environment.
///
/// Owned by the caller; the pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRequest {
    pub execution_id: ExecutionId,
    pub module: ModuleDescriptor,
    pub target: Environment,
    /// Identity of whoever asked for the promotion.
    pub requested_by: String,
    /// Opt-in for approval gating of sensitive environments.
    pub require_approval: bool,
    pub metadata: HashMap<String, String>,
}

impl DeploymentRequest {
    /// Create a request with a fresh execution id.
    pub fn new(module: ModuleDescriptor, target: Environment, requested_by: &str) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            module,
            target,
            requested_by: requested_by.to_string(),
            require_approval: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_execution_id(mut self, execution_id: &str) -> Self {
        self.execution_id = execution_id.to_string();
        self
    }

    pub fn with_approval(mut self, require_approval: bool) -> Self {
        self.require_approval = require_approval;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
