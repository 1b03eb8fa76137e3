//! Pipeline engine — drives one deployment request through its stages.
//!
//! ```text
//! [Approval]  Build  Test  Security-Scan
//!     ┌──────────────────────────────────────────┐
//!     │ for env in Development ..= target:       │
//!     │   [Approval-<env>]  Deploy-<env>         │
//!     │                     └ baseline → deploy → stabilization
//!     └──────────────────────────────────────────┘
//! Validation
//! ```
//!
//! Stages run strictly in order and the first failure halts the run.
//! `execute` never returns an error: every outcome, including collaborator
//! faults and cancellation, is recorded in the returned result.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use shipgate_approval::{ApprovalError, ApprovalGate, NewApproval};
use shipgate_core::{ApprovalMode, CancelSignal, DeploymentRequest, Environment};
use shipgate_rollout::{
    ClusterRegistry, MetricsProvider, StabilizationError, StabilizationMonitor, StrategyRegistry,
    capture_baseline,
};
use shipgate_state::{
    ApprovalStatus, AuditEvent, AuditEventKind, ExecutionSnapshot, ExecutionState,
    PipelineExecutionResult, PipelineStageResult,
};

use crate::config::PipelineConfig;
use crate::observers::{AuditSink, ExecutionTracker, NoopObserver, ProgressNotifier};
use crate::stages::{ModuleVerifier, StageExecutor, StageSet};

/// Joins an execution id and an environment into a per-environment approval key.
pub const APPROVAL_KEY_SEPARATOR: char = '/';

/// One planned step of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    /// Single gate ahead of everything, bound to the target environment.
    UpfrontApproval(Environment),
    Build,
    Test,
    SecurityScan,
    EnvironmentApproval(Environment),
    Deploy(Environment),
    Validation,
}

impl PipelineStep {
    /// Stage name recorded in the execution result.
    pub fn stage_name(&self) -> String {
        match self {
            PipelineStep::UpfrontApproval(_) => "Approval".to_string(),
            PipelineStep::Build => "Build".to_string(),
            PipelineStep::Test => "Test".to_string(),
            PipelineStep::SecurityScan => "Security-Scan".to_string(),
            PipelineStep::EnvironmentApproval(env) => format!("Approval-{env}"),
            PipelineStep::Deploy(env) => format!("Deploy-{env}"),
            PipelineStep::Validation => "Validation".to_string(),
        }
    }

    fn environment(&self) -> Option<Environment> {
        match self {
            PipelineStep::UpfrontApproval(env)
            | PipelineStep::EnvironmentApproval(env)
            | PipelineStep::Deploy(env) => Some(*env),
            _ => None,
        }
    }
}

/// Why a stage did not succeed.
enum StageError {
    Failed {
        message: String,
        error: Option<String>,
    },
    Cancelled,
}

impl StageError {
    fn failed(message: impl Into<String>) -> Self {
        StageError::Failed {
            message: message.into(),
            error: None,
        }
    }

    fn fault(message: impl Into<String>, err: &anyhow::Error) -> Self {
        StageError::Failed {
            message: message.into(),
            error: Some(format!("{err:#}")),
        }
    }
}

type StageRun = Result<String, StageError>;

/// Values carried between stages of one run.
#[derive(Default)]
struct RunContext {
    artifact: Option<Vec<u8>>,
}

/// Sequences stages for deployment requests.
///
/// One engine serves any number of concurrent executions; all per-run
/// state lives on the stack of `execute`.
pub struct PipelineEngine {
    config: PipelineConfig,
    stages: StageSet,
    verifier: Arc<dyn ModuleVerifier>,
    clusters: Arc<dyn ClusterRegistry>,
    strategies: StrategyRegistry,
    approvals: Arc<ApprovalGate>,
    monitor: Option<StabilizationMonitor>,
    audit: Arc<dyn AuditSink>,
    trackers: Vec<Arc<dyn ExecutionTracker>>,
    progress: Arc<dyn ProgressNotifier>,
}

impl PipelineEngine {
    pub fn new(
        config: PipelineConfig,
        stages: StageSet,
        verifier: Arc<dyn ModuleVerifier>,
        clusters: Arc<dyn ClusterRegistry>,
        strategies: StrategyRegistry,
        approvals: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            config,
            stages,
            verifier,
            clusters,
            strategies,
            approvals,
            monitor: None,
            audit: Arc::new(NoopObserver),
            trackers: Vec::new(),
            progress: Arc::new(NoopObserver),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Add a tracker. Every tracker sees every snapshot.
    pub fn with_tracker(mut self, tracker: Arc<dyn ExecutionTracker>) -> Self {
        self.trackers.push(tracker);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressNotifier>) -> Self {
        self.progress = progress;
        self
    }

    /// Enable stabilization waits for environments that configure one.
    pub fn with_metrics(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.monitor = Some(StabilizationMonitor::new(provider));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// The steps `request` will run, in order, if nothing fails.
    pub fn plan(&self, request: &DeploymentRequest) -> Vec<PipelineStep> {
        let upfront = self.config.approval_mode == ApprovalMode::Upfront
            && self
                .config
                .requires_approval(request.target, request.require_approval);

        let mut steps = Vec::new();
        if upfront {
            steps.push(PipelineStep::UpfrontApproval(request.target));
        }
        steps.extend([
            PipelineStep::Build,
            PipelineStep::Test,
            PipelineStep::SecurityScan,
        ]);
        for &env in request.target.promotion_chain() {
            if !upfront && self.config.requires_approval(env, request.require_approval) {
                steps.push(PipelineStep::EnvironmentApproval(env));
            }
            steps.push(PipelineStep::Deploy(env));
        }
        steps.push(PipelineStep::Validation);
        steps
    }

    /// Run the full pipeline for `request`.
    pub async fn execute(
        &self,
        request: &DeploymentRequest,
        cancel: &CancelSignal,
    ) -> PipelineExecutionResult {
        let execution_id = request.execution_id.as_str();
        let trace_id = uuid::Uuid::new_v4().to_string();
        let mut result = PipelineExecutionResult::new(execution_id, &trace_id);
        let plan = self.plan(request);

        info!(
            %execution_id,
            %trace_id,
            module = %request.module.name,
            version = %request.module.version,
            target = %request.target,
            stages = plan.len(),
            "pipeline started"
        );
        self.record_audit(AuditEvent::new(
            execution_id,
            AuditEventKind::PipelineStarted,
            format!(
                "{}@{} → {} requested by {}",
                request.module.name, request.module.version, request.target, request.requested_by
            ),
        ))
        .await;
        self.publish(ExecutionState::Running, None, &result).await;

        let mut ctx = RunContext::default();
        let mut outcome: Result<(), String> = Ok(());

        for (index, step) in plan.iter().enumerate() {
            let name = step.stage_name();
            if cancel.is_cancelled() {
                outcome = Err(format!("Pipeline cancelled before stage {name}"));
                break;
            }

            let mut stage = PipelineStageResult::pending(&name);
            if let Some(env) = step.environment() {
                stage = stage.for_environment(env);
            }
            stage.start();
            result.push_stage(stage.clone());

            info!(%execution_id, stage = %name, "stage started");
            self.record_audit(
                AuditEvent::new(execution_id, AuditEventKind::StageStarted, "started")
                    .with_stage(&name),
            )
            .await;
            self.report_progress(execution_id, &name, percent(index, plan.len()))
                .await;
            self.publish(ExecutionState::Running, Some(&name), &result)
                .await;

            let run = self
                .run_step(*step, request, &mut stage, &mut ctx, &result, cancel)
                .await;

            let halted = match run {
                Ok(message) => {
                    stage.succeed(message);
                    None
                }
                Err(StageError::Failed { message, error }) => {
                    let summary = format!("Pipeline failed at stage {name}: {message}");
                    stage.fail(message, error);
                    Some(summary)
                }
                Err(StageError::Cancelled) => {
                    stage.fail("cancelled", None);
                    Some(format!("Pipeline cancelled during stage {name}"))
                }
            };

            if halted.is_some() {
                warn!(%execution_id, stage = %name, detail = %stage.message, "stage failed");
            } else {
                info!(%execution_id, stage = %name, "stage succeeded");
            }
            self.record_audit(
                AuditEvent::new(
                    execution_id,
                    AuditEventKind::StageCompleted,
                    format!("{:?}: {}", stage.status, stage.message),
                )
                .with_stage(&name),
            )
            .await;
            if let Some(slot) = result.stages.last_mut() {
                *slot = stage;
            }

            if let Some(summary) = halted {
                outcome = Err(summary);
                break;
            }
        }

        let (success, message) = match outcome {
            Ok(()) => (
                true,
                format!(
                    "Pipeline completed: {}@{} deployed to {}",
                    request.module.name, request.module.version, request.target
                ),
            ),
            Err(message) => (false, message),
        };
        result.finish(success, message);

        let final_state = if success {
            ExecutionState::Succeeded
        } else {
            ExecutionState::Failed
        };
        if success {
            self.report_progress(execution_id, "Completed", 100).await;
        }
        self.publish(final_state, None, &result).await;
        self.record_audit(AuditEvent::new(
            execution_id,
            AuditEventKind::PipelineCompleted,
            result.message.clone(),
        ))
        .await;

        info!(
            %execution_id,
            success,
            stages = result.stages.len(),
            summary = %result.message,
            "pipeline finished"
        );
        result
    }

    async fn run_step(
        &self,
        step: PipelineStep,
        request: &DeploymentRequest,
        stage: &mut PipelineStageResult,
        ctx: &mut RunContext,
        result: &PipelineExecutionResult,
        cancel: &CancelSignal,
    ) -> StageRun {
        match step {
            PipelineStep::UpfrontApproval(env) => {
                self.run_approval(request, env, request.execution_id.clone(), result, cancel)
                    .await
            }
            PipelineStep::EnvironmentApproval(env) => {
                let key = format!(
                    "{}{APPROVAL_KEY_SEPARATOR}{}",
                    request.execution_id,
                    env.label()
                );
                self.run_approval(request, env, key, result, cancel).await
            }
            PipelineStep::Build => {
                let outcome = self
                    .run_executor("Build", &self.stages.build, request, cancel)
                    .await?;
                ctx.artifact = outcome.1;
                Ok(outcome.0)
            }
            PipelineStep::Test => Ok(self
                .run_executor("Test", &self.stages.test, request, cancel)
                .await?
                .0),
            PipelineStep::SecurityScan => self.run_security_scan(request, ctx, cancel).await,
            PipelineStep::Deploy(env) => self.run_deploy(request, env, stage, cancel).await,
            PipelineStep::Validation => Ok(self
                .run_executor("Validation", &self.stages.validation, request, cancel)
                .await?
                .0),
        }
    }

    // ── Stage implementations ──────────────────────────────────────

    async fn run_executor(
        &self,
        name: &str,
        executor: &Arc<dyn StageExecutor>,
        request: &DeploymentRequest,
        cancel: &CancelSignal,
    ) -> Result<(String, Option<Vec<u8>>), StageError> {
        match until_cancelled(cancel, executor.run(request)).await? {
            Ok(outcome) if outcome.succeeded => Ok((outcome.message, outcome.artifact)),
            Ok(outcome) => Err(StageError::failed(outcome.message)),
            Err(e) => {
                error!(execution_id = %request.execution_id, stage = name, error = %e, "stage executor fault");
                Err(StageError::fault(format!("{name} executor failed"), &e))
            }
        }
    }

    async fn run_security_scan(
        &self,
        request: &DeploymentRequest,
        ctx: &RunContext,
        cancel: &CancelSignal,
    ) -> StageRun {
        let (scan_message, _) = self
            .run_executor("Security-Scan", &self.stages.security_scan, request, cancel)
            .await?;

        let Some(artifact) = ctx.artifact.as_deref() else {
            return Err(StageError::failed("build produced no artifact to verify"));
        };

        let report = match until_cancelled(cancel, self.verifier.validate(&request.module, artifact))
            .await?
        {
            Ok(report) => report,
            Err(e) => {
                error!(execution_id = %request.execution_id, error = %e, "module verifier fault");
                return Err(StageError::fault("module verification failed", &e));
            }
        };

        if !report.valid {
            let detail = if report.messages.is_empty() {
                "no details".to_string()
            } else {
                report.messages.join("; ")
            };
            return Err(StageError::failed(format!(
                "module verification rejected the artifact: {detail}"
            )));
        }

        debug!(execution_id = %request.execution_id, bytes = artifact.len(), "artifact verified");
        Ok(format!("{scan_message}; module verified"))
    }

    async fn run_approval(
        &self,
        request: &DeploymentRequest,
        environment: Environment,
        key: String,
        result: &PipelineExecutionResult,
        cancel: &CancelSignal,
    ) -> StageRun {
        let execution_id = request.execution_id.as_str();
        let new = NewApproval::for_request(request, environment).with_key(key.clone());

        let created = match self.approvals.create_request(new).await {
            Ok(created) => created,
            Err(e) => {
                return Err(StageError::Failed {
                    message: "could not open approval request".to_string(),
                    error: Some(e.to_string()),
                });
            }
        };

        info!(
            %execution_id,
            approval_id = %created.approval_id,
            %environment,
            "waiting for approval"
        );
        self.record_audit(AuditEvent::new(
            execution_id,
            AuditEventKind::ApprovalRequested,
            format!("approval {} requested for {environment}", created.approval_id),
        ))
        .await;
        let stage_name = result.stages.last().map(|s| s.name.as_str());
        self.publish(ExecutionState::PendingApproval, stage_name, result)
            .await;

        let decided = self.approvals.wait_for_decision(&key, cancel).await;

        let run = match decided {
            Err(ApprovalError::Cancelled(_)) => return Err(StageError::Cancelled),
            Err(e) => Err(StageError::Failed {
                message: "approval wait failed".to_string(),
                error: Some(e.to_string()),
            }),
            Ok(decision) => {
                let by = decision.responded_by.as_deref().unwrap_or("unknown");
                let reason = decision.reason.as_deref().unwrap_or("no reason given");
                match decision.status {
                    ApprovalStatus::Approved => Ok(format!("approved by {by}")),
                    ApprovalStatus::Rejected => {
                        Err(StageError::failed(format!("rejected by {by}: {reason}")))
                    }
                    ApprovalStatus::Expired => {
                        Err(StageError::failed(format!("approval expired: {reason}")))
                    }
                    ApprovalStatus::Pending => Err(StageError::failed("approval still pending")),
                }
            }
        };

        self.record_audit(AuditEvent::new(
            execution_id,
            AuditEventKind::ApprovalResolved,
            match &run {
                Ok(message) => message.clone(),
                Err(StageError::Failed { message, .. }) => message.clone(),
                Err(StageError::Cancelled) => "cancelled".to_string(),
            },
        ))
        .await;
        self.publish(ExecutionState::Running, stage_name, result)
            .await;
        run
    }

    async fn run_deploy(
        &self,
        request: &DeploymentRequest,
        environment: Environment,
        stage: &mut PipelineStageResult,
        cancel: &CancelSignal,
    ) -> StageRun {
        let execution_id = request.execution_id.as_str();

        let cluster = match until_cancelled(cancel, self.clusters.get_cluster(environment)).await? {
            Ok(cluster) => cluster,
            Err(e) => {
                error!(%execution_id, %environment, error = %e, "cluster lookup failed");
                return Err(StageError::fault(
                    format!("no cluster available for {environment}"),
                    &e,
                ));
            }
        };

        let Some(strategy) = self.strategies.resolve(environment) else {
            return Err(StageError::failed(format!(
                "no deployment strategy registered for {environment}"
            )));
        };
        stage.strategy = Some(strategy.name().to_string());

        let stabilization = match (&self.monitor, self.config.stabilization_for(environment)) {
            (Some(monitor), Some(config)) => {
                let baseline = match until_cancelled(
                    cancel,
                    capture_baseline(monitor.provider().as_ref(), &cluster.node_ids),
                )
                .await?
                {
                    Ok(baseline) => baseline,
                    Err(e) => {
                        error!(%execution_id, %environment, error = %e, "baseline capture failed");
                        return Err(StageError::fault("could not capture metrics baseline", &e));
                    }
                };
                debug!(%execution_id, %environment, ?baseline, "baseline captured");
                Some((monitor, config, baseline))
            }
            (None, Some(_)) => {
                error!(%execution_id, %environment, "stabilization configured without a metrics provider");
                return Err(StageError::failed(format!(
                    "stabilization configured for {environment} but no metrics provider is attached"
                )));
            }
            (_, None) => None,
        };

        info!(
            %execution_id,
            %environment,
            cluster = %cluster.id,
            strategy = strategy.name(),
            nodes = cluster.node_ids.len(),
            "deploying"
        );

        let outcome = match until_cancelled(cancel, strategy.deploy(request, &cluster)).await? {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%execution_id, %environment, error = %e, "deployment strategy fault");
                return Err(StageError::fault(
                    format!("{} deployment failed", strategy.name()),
                    &e,
                ));
            }
        };
        stage.nodes_succeeded = Some(outcome.nodes_succeeded());
        stage.nodes_failed = Some(outcome.nodes_failed());

        if !outcome.success {
            return Err(StageError::Failed {
                message: outcome.message,
                error: outcome.error,
            });
        }

        let Some((monitor, config, baseline)) = stabilization else {
            return Ok(outcome.message);
        };

        match monitor
            .wait_for_stabilization(&cluster.node_ids, &baseline, config, cancel)
            .await
        {
            Ok(verdict) if verdict.is_stable => {
                Ok(format!("{}; {}", outcome.message, verdict.message))
            }
            Ok(verdict) => Err(StageError::failed(format!(
                "resources did not stabilize: {}",
                verdict.message
            ))),
            Err(StabilizationError::Cancelled) => Err(StageError::Cancelled),
            Err(StabilizationError::Metrics(e)) => {
                error!(%execution_id, %environment, error = %e, "metrics provider fault");
                Err(StageError::fault("stabilization monitoring failed", &e))
            }
        }
    }

    // ── Observers ──────────────────────────────────────────────────

    async fn record_audit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event).await {
            warn!(execution_id = %event.execution_id, kind = ?event.kind, error = %e, "audit sink failed");
        }
    }

    async fn publish(
        &self,
        state: ExecutionState,
        current_stage: Option<&str>,
        result: &PipelineExecutionResult,
    ) {
        if self.trackers.is_empty() {
            return;
        }
        let snapshot = ExecutionSnapshot::new(state, current_stage, result);
        for tracker in &self.trackers {
            if let Err(e) = tracker.update_state(&result.execution_id, &snapshot).await {
                warn!(execution_id = %result.execution_id, ?state, error = %e, "execution tracker failed");
            }
        }
    }

    async fn report_progress(&self, execution_id: &str, stage: &str, percent: u8) {
        if let Err(e) = self.progress.notify_progress(execution_id, stage, percent).await {
            warn!(%execution_id, stage, error = %e, "progress notifier failed");
        }
    }
}

/// Percent complete when stage `index` of `total` starts.
fn percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((index * 100) / total).min(100) as u8
}

/// Race `fut` against cancellation.
async fn until_cancelled<T>(
    cancel: &CancelSignal,
    fut: impl Future<Output = T>,
) -> Result<T, StageError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        value = fut => Ok(value),
    }
}
