//! shipgate-pipeline — staged promotion of a module across environments.
//!
//! The engine takes a `DeploymentRequest` and runs it through build, test,
//! security scan, one deploy per environment in the promotion chain, and a
//! final validation. Sensitive environments can be gated on human approval,
//! and deploys can wait for live metrics to settle before succeeding.
//!
//! # Architecture
//!
//! ```text
//! DeploymentService
//!   ├── submit / cancel / wait_for_completion   one tokio task per execution
//!   ├── ExecutionCache                           latest snapshot per execution
//!   └── PipelineEngine
//!       ├── StageSet + ModuleVerifier            build, test, scan, validation
//!       ├── ApprovalGate                         upfront or per-environment
//!       ├── ClusterRegistry + StrategyRegistry   one deploy per environment
//!       ├── StabilizationMonitor                 optional metric-driven wait
//!       └── AuditSink / ExecutionTracker / ProgressNotifier   best-effort
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observers;
pub mod service;
pub mod stages;

pub use config::PipelineConfig;
pub use engine::{APPROVAL_KEY_SEPARATOR, PipelineEngine, PipelineStep};
pub use error::{ServiceError, ServiceResult};
pub use observers::{AuditSink, ExecutionCache, ExecutionTracker, NoopObserver, ProgressNotifier};
pub use service::DeploymentService;
pub use stages::{ModuleVerifier, StageExecutor, StageOutcome, StageSet, VerificationReport};
