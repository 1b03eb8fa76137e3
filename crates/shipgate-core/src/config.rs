//! shipgate.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Environment;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ShipgateConfig {
    pub approval: ApprovalSettings,
    pub pipeline: PipelineSettings,
    pub stabilization: Vec<StabilizationSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// How long a request may stay pending (e.g. "24h").
    pub timeout: String,
    /// How often the expiry sweep runs (e.g. "1m").
    pub sweep_interval: String,
    /// Approvers used when a request names none. Empty means anyone.
    pub default_approvers: Vec<String>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            timeout: "24h".to_string(),
            sweep_interval: "1m".to_string(),
            default_approvers: Vec::new(),
        }
    }
}

impl ApprovalSettings {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration_field("approval.timeout", &self.timeout)
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration_field("approval.sweep_interval", &self.sweep_interval)
    }
}

/// Where approval gates are placed in a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// One gate before any other stage, bound to the target environment.
    #[default]
    Upfront,
    /// One gate right before each sensitive environment in the chain.
    PerEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub approval_mode: ApprovalMode,
    /// Environments that need approval when the request opts in.
    pub approval_environments: Vec<Environment>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Upfront,
            approval_environments: Environment::ALL
                .into_iter()
                .filter(|e| e.is_sensitive())
                .collect(),
        }
    }
}

/// Metric-driven stabilization settings for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizationSettings {
    pub environment: Environment,
    #[serde(default = "default_threshold")]
    pub cpu_threshold_percent: f64,
    #[serde(default = "default_threshold")]
    pub memory_threshold_percent: f64,
    #[serde(default = "default_threshold")]
    pub latency_threshold_percent: f64,
    #[serde(default = "default_polling_interval")]
    pub polling_interval: String,
    #[serde(default = "default_required_checks")]
    pub required_consecutive_checks: u32,
    #[serde(default = "default_minimum_wait")]
    pub minimum_wait: String,
    #[serde(default = "default_maximum_wait")]
    pub maximum_wait: String,
}

fn default_threshold() -> f64 {
    10.0
}

fn default_polling_interval() -> String {
    "30s".to_string()
}

fn default_required_checks() -> u32 {
    3
}

fn default_minimum_wait() -> String {
    "2m".to_string()
}

fn default_maximum_wait() -> String {
    "15m".to_string()
}

impl StabilizationSettings {
    pub fn polling_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration_field("stabilization.polling_interval", &self.polling_interval)
    }

    pub fn minimum_wait(&self) -> Result<Duration, ConfigError> {
        parse_duration_field("stabilization.minimum_wait", &self.minimum_wait)
    }

    pub fn maximum_wait(&self) -> Result<Duration, ConfigError> {
        parse_duration_field("stabilization.maximum_wait", &self.maximum_wait)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let env = self.environment;
        for (name, value) in [
            ("cpu_threshold_percent", self.cpu_threshold_percent),
            ("memory_threshold_percent", self.memory_threshold_percent),
            ("latency_threshold_percent", self.latency_threshold_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "stabilization for {env}: {name} must be a non-negative number"
                )));
            }
        }
        if self.required_consecutive_checks == 0 {
            return Err(ConfigError::Invalid(format!(
                "stabilization for {env}: required_consecutive_checks must be at least 1"
            )));
        }
        if self.polling_interval()?.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "stabilization for {env}: polling_interval must be non-zero"
            )));
        }
        if self.maximum_wait()? < self.minimum_wait()? {
            return Err(ConfigError::Invalid(format!(
                "stabilization for {env}: maximum_wait is shorter than minimum_wait"
            )));
        }
        Ok(())
    }
}

impl ShipgateConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Stabilization settings for an environment, if configured.
    pub fn stabilization_for(&self, environment: Environment) -> Option<&StabilizationSettings> {
        self.stabilization
            .iter()
            .find(|s| s.environment == environment)
    }

    /// Check every field that only has meaning once parsed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.approval.timeout()?;
        if self.approval.sweep_interval()?.is_zero() {
            return Err(ConfigError::Invalid(
                "approval.sweep_interval must be non-zero".to_string(),
            ));
        }

        let mut seen = Vec::new();
        for s in &self.stabilization {
            if seen.contains(&s.environment) {
                return Err(ConfigError::Invalid(format!(
                    "stabilization configured twice for {}",
                    s.environment
                )));
            }
            seen.push(s.environment);
            s.validate()?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ShipgateConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: ShipgateConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// Parse a human duration such as `500ms`, `30s`, `5m` or `24h`.
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let (digits, scale) = if let Some(v) = s.strip_suffix('s') {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .map(Duration::from_secs)
}

fn parse_duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}
