//! End-to-end pipeline scenarios against scripted collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;

use shipgate_approval::{ApprovalGate, ApprovalGateConfig};
use shipgate_core::{
    ApprovalMode, CancelSignal, DeploymentRequest, Environment, ModuleDescriptor, cancel_pair,
};
use shipgate_pipeline::{
    AuditSink, DeploymentService, ExecutionTracker, ModuleVerifier, PipelineConfig,
    PipelineEngine, ProgressNotifier, ServiceError, StageExecutor, StageOutcome, StageSet,
    VerificationReport,
};
use shipgate_rollout::{
    ClusterHandle, ClusterRegistry, DeploymentOutcome, DeploymentStrategy, MetricsProvider,
    NodeDeployResult,
    NodeMetrics, ResourceStabilizationConfig, StaticClusterRegistry, StrategyRegistry,
};
use shipgate_state::{
    ApprovalStatus, AuditEvent, AuditEventKind, ExecutionSnapshot, ExecutionState,
    PipelineExecutionResult, StageStatus, StateStore,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=shipgate=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Scripted collaborators ───────────────────────────────────────

struct Step {
    succeed: bool,
    artifact: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl Step {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            artifact: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn build() -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            artifact: Some(b"\0asm-module".to_vec()),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: false,
            artifact: None,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StageExecutor for Step {
    async fn run(&self, _request: &DeploymentRequest) -> anyhow::Result<StageOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.succeed {
            return Ok(StageOutcome::failure("3 tests failed"));
        }
        let outcome = StageOutcome::success("ok");
        Ok(match &self.artifact {
            Some(bytes) => outcome.with_artifact(bytes.clone()),
            None => outcome,
        })
    }
}

struct Verifier {
    valid: bool,
}

#[async_trait]
impl ModuleVerifier for Verifier {
    async fn validate(
        &self,
        _module: &ModuleDescriptor,
        artifact: &[u8],
    ) -> anyhow::Result<VerificationReport> {
        assert!(!artifact.is_empty());
        Ok(VerificationReport {
            valid: self.valid,
            messages: if self.valid {
                Vec::new()
            } else {
                vec!["signature mismatch".to_string()]
            },
        })
    }
}

/// Deploys every node, failing all of them in `fail_in`.
struct Direct {
    fail_in: Option<Environment>,
    deployed: Mutex<Vec<Environment>>,
}

impl Direct {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_in: None,
            deployed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl DeploymentStrategy for Direct {
    fn name(&self) -> &str {
        "direct"
    }

    async fn deploy(
        &self,
        _request: &DeploymentRequest,
        cluster: &ClusterHandle,
    ) -> anyhow::Result<DeploymentOutcome> {
        self.deployed.lock().unwrap().push(cluster.environment);
        let success = self.fail_in != Some(cluster.environment);
        Ok(DeploymentOutcome::from_nodes(
            cluster
                .node_ids
                .iter()
                .map(|id| NodeDeployResult {
                    node_id: id.clone(),
                    success,
                    message: String::new(),
                })
                .collect(),
        ))
    }
}

/// First call is the baseline; later calls pop from the script, repeating the last entry.
struct ScriptedMetrics {
    script: Mutex<VecDeque<f64>>,
}

impl ScriptedMetrics {
    fn new(baseline_then_cpu: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(baseline_then_cpu.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl MetricsProvider for ScriptedMetrics {
    async fn get_node_metrics(&self, node_ids: &[String]) -> anyhow::Result<Vec<NodeMetrics>> {
        let mut script = self.script.lock().unwrap();
        let cpu = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            *script.front().unwrap()
        };
        Ok(node_ids
            .iter()
            .map(|_| NodeMetrics {
                cpu_percent: cpu,
                memory_percent: 50.0,
                latency_ms: 20.0,
            })
            .collect())
    }
}

/// Every call fails outright.
struct Faulty;

#[async_trait]
impl StageExecutor for Faulty {
    async fn run(&self, _request: &DeploymentRequest) -> anyhow::Result<StageOutcome> {
        anyhow::bail!("runner crashed")
    }
}

#[async_trait]
impl ModuleVerifier for Faulty {
    async fn validate(&self, _: &ModuleDescriptor, _: &[u8]) -> anyhow::Result<VerificationReport> {
        anyhow::bail!("verifier offline")
    }
}

#[async_trait]
impl ClusterRegistry for Faulty {
    async fn get_cluster(&self, environment: Environment) -> anyhow::Result<ClusterHandle> {
        anyhow::bail!("inventory has no entry for {environment}")
    }
}

#[async_trait]
impl DeploymentStrategy for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn deploy(
        &self,
        _request: &DeploymentRequest,
        _cluster: &ClusterHandle,
    ) -> anyhow::Result<DeploymentOutcome> {
        anyhow::bail!("control plane timed out")
    }
}

struct Broken;

#[async_trait]
impl AuditSink for Broken {
    async fn record(&self, _event: &AuditEvent) -> anyhow::Result<()> {
        anyhow::bail!("audit backend unreachable")
    }
}

#[async_trait]
impl ExecutionTracker for Broken {
    async fn update_state(&self, _: &str, _: &ExecutionSnapshot) -> anyhow::Result<()> {
        anyhow::bail!("tracker unreachable")
    }
}

#[async_trait]
impl ProgressNotifier for Broken {
    async fn notify_progress(&self, _: &str, _: &str, _: u8) -> anyhow::Result<()> {
        anyhow::bail!("progress channel closed")
    }
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<ExecutionState>>,
    progress: Mutex<Vec<(String, u8)>>,
}

#[async_trait]
impl ExecutionTracker for Recorder {
    async fn update_state(&self, _: &str, snapshot: &ExecutionSnapshot) -> anyhow::Result<()> {
        self.states.lock().unwrap().push(snapshot.state);
        Ok(())
    }
}

#[async_trait]
impl ProgressNotifier for Recorder {
    async fn notify_progress(&self, _: &str, stage: &str, percent: u8) -> anyhow::Result<()> {
        self.progress
            .lock()
            .unwrap()
            .push((stage.to_string(), percent));
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────

const APPROVER: &str = "release-lead@example.com";

fn clusters() -> Arc<StaticClusterRegistry> {
    let mut registry = StaticClusterRegistry::new();
    for env in Environment::ALL {
        registry = registry.with_cluster(ClusterHandle {
            id: format!("{}-cluster", env.label().to_lowercase()),
            environment: env,
            node_ids: vec![format!("{env}-1"), format!("{env}-2")],
        });
    }
    Arc::new(registry)
}

fn gate() -> Arc<ApprovalGate> {
    Arc::new(ApprovalGate::new(ApprovalGateConfig {
        default_approvers: vec![APPROVER.to_string()],
        ..Default::default()
    }))
}

fn engine_with(config: PipelineConfig, stages: StageSet, strategy: Arc<Direct>) -> PipelineEngine {
    PipelineEngine::new(
        config,
        stages,
        Arc::new(Verifier { valid: true }),
        clusters(),
        StrategyRegistry::uniform(strategy),
        gate(),
    )
}

fn default_stages() -> StageSet {
    StageSet {
        build: Step::build(),
        test: Step::ok(),
        security_scan: Step::ok(),
        validation: Step::ok(),
    }
}

fn engine() -> PipelineEngine {
    engine_with(PipelineConfig::default(), default_stages(), Direct::new())
}

fn request(id: &str, target: Environment) -> DeploymentRequest {
    DeploymentRequest::new(
        ModuleDescriptor::new("billing", semver::Version::new(2, 4, 0)),
        target,
        "dev@example.com",
    )
    .with_execution_id(id)
}

/// Poll until an approval under `key` is pending.
async fn await_pending(gate: &ApprovalGate, key: &str) {
    for _ in 0..500 {
        if gate
            .get(key)
            .is_some_and(|r| r.status == ApprovalStatus::Pending)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no pending approval for {key}");
}

const PRODUCTION_STAGES: [&str; 8] = [
    "Build",
    "Test",
    "Security-Scan",
    "Deploy-Development",
    "Deploy-QA",
    "Deploy-Staging",
    "Deploy-Production",
    "Validation",
];

// ── Approval flows ───────────────────────────────────────────────

#[tokio::test]
async fn approved_production_release_runs_nine_stages() {
    init_tracing();
    let service = DeploymentService::new(engine());
    let id = service
        .submit_deployment(request("rel-1", Environment::Production).with_approval(true))
        .unwrap();

    await_pending(service.engine().approvals(), &id).await;
    assert_eq!(service.get_pending_approvals().len(), 1);
    assert_eq!(
        service.get_execution_state(&id).unwrap().state,
        ExecutionState::PendingApproval
    );

    let decided = service
        .decide_approval(&id, APPROVER, true, Some("change window open"))
        .await
        .unwrap();
    assert_eq!(decided.status, ApprovalStatus::Approved);

    let result = service.wait_for_completion(&id).await.unwrap();
    assert!(result.success, "{}", result.message);
    assert_eq!(result.stages.len(), 9);
    let mut expected = vec!["Approval"];
    expected.extend(PRODUCTION_STAGES);
    assert_eq!(result.stage_names(), expected);
    assert!(result.stages.iter().all(|s| s.status == StageStatus::Succeeded));
    assert!(result.is_finished());

    let deploy = result.stage("Deploy-Production").unwrap();
    assert_eq!(deploy.strategy.as_deref(), Some("direct"));
    assert_eq!(deploy.nodes_succeeded, Some(2));
    assert_eq!(deploy.nodes_failed, Some(0));

    assert_eq!(
        service.get_execution_state(&id).unwrap().state,
        ExecutionState::Succeeded
    );
}

#[tokio::test]
async fn rejected_approval_stops_before_build() {
    init_tracing();
    let build = Step::build();
    let stages = StageSet {
        build: build.clone(),
        ..default_stages()
    };
    let service = DeploymentService::new(engine_with(
        PipelineConfig::default(),
        stages,
        Direct::new(),
    ));
    let id = service
        .submit_deployment(request("rel-2", Environment::Production).with_approval(true))
        .unwrap();

    await_pending(service.engine().approvals(), &id).await;
    service
        .decide_approval(&id, APPROVER, false, Some("freeze in effect"))
        .await
        .unwrap();

    let result = service.wait_for_completion(&id).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.stage_names(), vec!["Approval"]);
    assert_eq!(result.stages[0].status, StageStatus::Failed);
    assert!(result.stages[0].message.contains("freeze in effect"));
    assert!(result.message.contains("Approval"));
    assert_eq!(build.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_approval_fails_the_gate() {
    init_tracing();
    let approvals = Arc::new(ApprovalGate::new(ApprovalGateConfig {
        timeout: Duration::ZERO,
        ..Default::default()
    }));
    let engine = PipelineEngine::new(
        PipelineConfig::default(),
        default_stages(),
        Arc::new(Verifier { valid: true }),
        clusters(),
        StrategyRegistry::uniform(Direct::new()),
        approvals.clone(),
    );
    let service = DeploymentService::new(engine);
    let id = service
        .submit_deployment(request("rel-3", Environment::Staging).with_approval(true))
        .unwrap();

    await_pending(&approvals, &id).await;
    assert_eq!(approvals.sweep_expired().await, 1);

    let result = service.wait_for_completion(&id).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.stage_names(), vec!["Approval"]);
    assert!(result.stages[0].message.contains("expired"));
}

#[tokio::test]
async fn per_environment_gates_precede_sensitive_deploys() {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let config = PipelineConfig::default().with_approval_mode(ApprovalMode::PerEnvironment);
    let engine = engine_with(config, default_stages(), Direct::new()).with_tracker(recorder.clone());
    let service = DeploymentService::new(engine);
    let id = service
        .submit_deployment(request("rel-4", Environment::Production).with_approval(true))
        .unwrap();

    let gate = service.engine().approvals().clone();
    await_pending(&gate, "rel-4/Staging").await;
    assert!(gate.get("rel-4").is_none());
    service
        .decide_approval(&id, APPROVER, true, None)
        .await
        .unwrap();

    await_pending(&gate, "rel-4/Production").await;
    service
        .decide_approval(&id, APPROVER, true, None)
        .await
        .unwrap();

    let result = service.wait_for_completion(&id).await.unwrap();
    assert!(result.success, "{}", result.message);
    assert_eq!(
        result.stage_names(),
        vec![
            "Build",
            "Test",
            "Security-Scan",
            "Deploy-Development",
            "Deploy-QA",
            "Approval-Staging",
            "Deploy-Staging",
            "Approval-Production",
            "Deploy-Production",
            "Validation",
        ]
    );

    let states = recorder.states.lock().unwrap();
    assert_eq!(
        states
            .iter()
            .filter(|s| **s == ExecutionState::PendingApproval)
            .count(),
        2
    );
    assert_eq!(states.last(), Some(&ExecutionState::Succeeded));
}

#[tokio::test]
async fn approval_is_skipped_without_opt_in() {
    let result = engine()
        .execute(&request("rel-5", Environment::Production), &CancelSignal::never())
        .await;
    assert!(result.success, "{}", result.message);
    assert_eq!(result.stage_names(), PRODUCTION_STAGES.to_vec());
}

// ── Stage failures ───────────────────────────────────────────────

#[tokio::test]
async fn failed_stage_halts_pipeline() {
    init_tracing();
    let strategy = Direct::new();
    let stages = StageSet {
        test: Step::failing(),
        ..default_stages()
    };
    let result = engine_with(PipelineConfig::default(), stages, strategy.clone())
        .execute(&request("rel-6", Environment::Qa), &CancelSignal::never())
        .await;

    assert!(!result.success);
    assert_eq!(result.stage_names(), vec!["Build", "Test"]);
    assert_eq!(result.failed_stage().unwrap().name, "Test");
    assert!(result.message.starts_with("Pipeline failed at stage Test"));
    assert!(strategy.deployed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_module_fails_security_scan() {
    let engine = PipelineEngine::new(
        PipelineConfig::default(),
        default_stages(),
        Arc::new(Verifier { valid: false }),
        clusters(),
        StrategyRegistry::uniform(Direct::new()),
        gate(),
    );
    let result = engine
        .execute(&request("rel-7", Environment::Development), &CancelSignal::never())
        .await;

    assert!(!result.success);
    let scan = result.stage("Security-Scan").unwrap();
    assert_eq!(scan.status, StageStatus::Failed);
    assert!(scan.message.contains("signature mismatch"));
    assert_eq!(result.stages.last().unwrap().name, "Security-Scan");
}

#[tokio::test]
async fn node_failures_fail_the_deploy() {
    let strategy = Arc::new(Direct {
        fail_in: Some(Environment::Qa),
        deployed: Mutex::new(Vec::new()),
    });
    let result = engine_with(PipelineConfig::default(), default_stages(), strategy.clone())
        .execute(&request("rel-8", Environment::Production), &CancelSignal::never())
        .await;

    assert!(!result.success);
    let deploy = result.stages.last().unwrap();
    assert_eq!(deploy.name, "Deploy-QA");
    assert_eq!(deploy.nodes_failed, Some(2));
    assert!(result.message.contains("Deploy-QA"));
    assert_eq!(
        *strategy.deployed.lock().unwrap(),
        vec![Environment::Development, Environment::Qa]
    );
}

#[tokio::test]
async fn missing_strategy_fails_that_environment() {
    let engine = PipelineEngine::new(
        PipelineConfig::default(),
        default_stages(),
        Arc::new(Verifier { valid: true }),
        clusters(),
        StrategyRegistry::new().with(Environment::Development, Direct::new()),
        gate(),
    );
    let result = engine
        .execute(&request("rel-9", Environment::Qa), &CancelSignal::never())
        .await;

    assert!(!result.success);
    let deploy = result.stages.last().unwrap();
    assert_eq!(deploy.name, "Deploy-QA");
    assert!(deploy.message.contains("no deployment strategy registered for QA"));
}

fn assert_faulted(result: &PipelineExecutionResult, stage: &str, message: &str, cause: &str) {
    assert!(!result.success);
    let last = result.stages.last().unwrap();
    assert_eq!(last.name, stage);
    assert_eq!(last.status, StageStatus::Failed);
    assert!(last.message.contains(message), "{}", last.message);
    assert!(last.error.as_deref().is_some_and(|e| e.contains(cause)), "{:?}", last.error);
    assert!(
        result.message.starts_with(&format!("Pipeline failed at stage {stage}")),
        "{}",
        result.message
    );
}

#[tokio::test]
async fn executor_fault_fails_the_stage_with_its_cause() {
    let strategy = Direct::new();
    let stages = StageSet {
        build: Arc::new(Faulty),
        ..default_stages()
    };
    let result = engine_with(PipelineConfig::default(), stages, strategy.clone())
        .execute(&request("rel-f1", Environment::Qa), &CancelSignal::never())
        .await;

    assert_faulted(&result, "Build", "Build executor failed", "runner crashed");
    assert_eq!(result.stages.len(), 1);
    assert!(strategy.deployed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn verifier_fault_fails_security_scan() {
    let engine = PipelineEngine::new(
        PipelineConfig::default(),
        default_stages(),
        Arc::new(Faulty),
        clusters(),
        StrategyRegistry::uniform(Direct::new()),
        gate(),
    );
    let result = engine
        .execute(&request("rel-f2", Environment::Qa), &CancelSignal::never())
        .await;

    assert_faulted(&result, "Security-Scan", "module verification failed", "verifier offline");
    assert_eq!(result.stage_names(), vec!["Build", "Test", "Security-Scan"]);
}

#[tokio::test]
async fn cluster_lookup_fault_fails_the_deploy() {
    let strategy = Direct::new();
    let engine = PipelineEngine::new(
        PipelineConfig::default(),
        default_stages(),
        Arc::new(Verifier { valid: true }),
        Arc::new(Faulty),
        StrategyRegistry::uniform(strategy.clone()),
        gate(),
    );
    let result = engine
        .execute(&request("rel-f3", Environment::Staging), &CancelSignal::never())
        .await;

    assert_faulted(&result, "Deploy-Development", "no cluster available", "inventory has no entry");
    assert!(strategy.deployed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn strategy_fault_fails_the_deploy() {
    let engine = PipelineEngine::new(
        PipelineConfig::default(),
        default_stages(),
        Arc::new(Verifier { valid: true }),
        clusters(),
        StrategyRegistry::new()
            .with(Environment::Development, Direct::new())
            .with(Environment::Qa, Arc::new(Faulty)),
        gate(),
    );
    let result = engine
        .execute(&request("rel-f4", Environment::Production), &CancelSignal::never())
        .await;

    assert_faulted(&result, "Deploy-QA", "faulty deployment failed", "control plane timed out");
    assert_eq!(result.stage("Deploy-QA").unwrap().strategy.as_deref(), Some("faulty"));
    assert_eq!(
        result.stage("Deploy-Development").unwrap().status,
        StageStatus::Succeeded
    );
}

// ── Observers ────────────────────────────────────────────────────

#[tokio::test]
async fn observer_faults_do_not_change_the_outcome() {
    init_tracing();
    let broken = Arc::new(Broken);
    let result = engine()
        .with_audit(broken.clone())
        .with_tracker(broken.clone())
        .with_progress(broken)
        .execute(&request("rel-10", Environment::Staging), &CancelSignal::never())
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.stages.len(), 7);
}

#[tokio::test]
async fn progress_reaches_completion() {
    let recorder = Arc::new(Recorder::default());
    let result = engine()
        .with_progress(recorder.clone())
        .execute(&request("rel-11", Environment::Qa), &CancelSignal::never())
        .await;
    assert!(result.success);

    let progress = recorder.progress.lock().unwrap();
    assert_eq!(progress.first(), Some(&("Build".to_string(), 0)));
    assert_eq!(progress.last(), Some(&("Completed".to_string(), 100)));
    assert!(progress.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[tokio::test]
async fn state_store_keeps_audit_trail_and_final_snapshot() {
    let store = StateStore::open_in_memory().unwrap();
    let result = engine()
        .with_audit(Arc::new(store.clone()))
        .with_tracker(Arc::new(store.clone()))
        .execute(&request("rel-12", Environment::Development), &CancelSignal::never())
        .await;
    assert!(result.success);

    let snapshot = store.get_execution("rel-12").unwrap().unwrap();
    assert_eq!(snapshot.state, ExecutionState::Succeeded);
    assert_eq!(snapshot.result, result);

    let events = store.list_audit_events("rel-12").unwrap();
    assert_eq!(events.first().unwrap().kind, AuditEventKind::PipelineStarted);
    assert_eq!(events.last().unwrap().kind, AuditEventKind::PipelineCompleted);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == AuditEventKind::StageCompleted)
            .count(),
        result.stages.len()
    );
}

// ── Cancellation and service control ─────────────────────────────

#[tokio::test]
async fn cancelling_an_approval_wait_returns_partial_result() {
    init_tracing();
    let service = DeploymentService::new(engine());
    let id = service
        .submit_deployment(request("rel-13", Environment::Production).with_approval(true))
        .unwrap();

    await_pending(service.engine().approvals(), &id).await;
    service.cancel(&id).unwrap();

    let result = service.wait_for_completion(&id).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.stage_names(), vec!["Approval"]);
    assert_eq!(result.stages[0].status, StageStatus::Failed);
    assert!(result.message.contains("cancelled"));
    assert_eq!(
        service.engine().approvals().get(&id).unwrap().status,
        ApprovalStatus::Pending
    );
}

#[tokio::test]
async fn cancelled_before_start_records_nothing() {
    let (handle, signal) = cancel_pair();
    handle.cancel();
    let result = engine()
        .execute(&request("rel-14", Environment::Qa), &signal)
        .await;
    assert!(!result.success);
    assert!(result.stages.is_empty());
    assert!(result.message.contains("Build"));
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
    let service = DeploymentService::new(engine());
    service
        .submit_deployment(request("rel-15", Environment::Development))
        .unwrap();
    let err = service
        .submit_deployment(request("rel-15", Environment::Development))
        .unwrap_err();
    assert!(matches!(err, ServiceError::Duplicate(ref id) if id == "rel-15"));

    let result = service.wait_for_completion("rel-15").await.unwrap();
    assert!(result.success);
    assert_eq!(service.get_execution_result("rel-15").unwrap(), result);
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let service = DeploymentService::new(engine());
    assert!(matches!(
        service.get_execution_result("nope"),
        Err(ServiceError::NotFound(_))
    ));
    assert!(matches!(service.cancel("nope"), Err(ServiceError::NotFound(_))));
    assert!(matches!(
        service.decide_approval("nope", APPROVER, true, None).await,
        Err(ServiceError::Approval(_))
    ));
}

// ── Stabilization ────────────────────────────────────────────────

fn fast_stabilization() -> ResourceStabilizationConfig {
    ResourceStabilizationConfig {
        polling_interval: Duration::from_secs(1),
        required_consecutive_checks: 3,
        minimum_wait: Duration::ZERO,
        maximum_wait: Duration::from_secs(10),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn stable_metrics_let_the_deploy_succeed() {
    let config = PipelineConfig::default()
        .with_stabilization(Environment::Development, fast_stabilization());
    let result = engine_with(config, default_stages(), Direct::new())
        .with_metrics(ScriptedMetrics::new(&[40.0, 41.0]))
        .execute(&request("rel-16", Environment::Development), &CancelSignal::never())
        .await;

    assert!(result.success, "{}", result.message);
    assert!(
        result
            .stage("Deploy-Development")
            .unwrap()
            .message
            .contains("deployed to 2 node(s)")
    );
}

#[tokio::test(start_paused = true)]
async fn unstable_metrics_fail_the_deploy() {
    let config = PipelineConfig::default()
        .with_stabilization(Environment::Qa, fast_stabilization());
    let result = engine_with(config, default_stages(), Direct::new())
        .with_metrics(ScriptedMetrics::new(&[40.0, 90.0]))
        .execute(&request("rel-17", Environment::Production), &CancelSignal::never())
        .await;

    assert!(!result.success);
    let deploy = result.stages.last().unwrap();
    assert_eq!(deploy.name, "Deploy-QA");
    assert!(deploy.message.contains("did not stabilize"));
    assert!(result.message.contains("Deploy-QA"));
}

#[tokio::test(start_paused = true)]
async fn stabilization_without_a_provider_fails_the_deploy() {
    let strategy = Direct::new();
    let config = PipelineConfig::default()
        .with_stabilization(Environment::Development, fast_stabilization());
    let result = engine_with(config, default_stages(), strategy.clone())
        .execute(&request("rel-18", Environment::Development), &CancelSignal::never())
        .await;

    assert!(!result.success);
    let deploy = result.stages.last().unwrap();
    assert_eq!(deploy.name, "Deploy-Development");
    assert_eq!(deploy.status, StageStatus::Failed);
    assert!(deploy.message.contains("no metrics provider"), "{}", deploy.message);
    assert!(strategy.deployed.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_stabilization_stops_the_deploy() {
    init_tracing();
    let config = PipelineConfig::default().with_stabilization(
        Environment::Development,
        ResourceStabilizationConfig {
            maximum_wait: Duration::from_secs(3600),
            ..fast_stabilization()
        },
    );
    let engine = Arc::new(
        engine_with(config, default_stages(), Direct::new())
            .with_metrics(ScriptedMetrics::new(&[40.0, 90.0])),
    );
    let (handle, signal) = cancel_pair();
    let run = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .execute(&request("rel-19", Environment::Development), &signal)
                .await
        }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.cancel();
    let result = run.await.unwrap();

    assert!(!result.success);
    let deploy = result.stages.last().unwrap();
    assert_eq!(deploy.name, "Deploy-Development");
    assert_eq!(deploy.status, StageStatus::Failed);
    assert_eq!(deploy.message, "cancelled");
    assert_eq!(deploy.nodes_succeeded, Some(2));
    assert!(
        result.message.contains("cancelled during stage Deploy-Development"),
        "{}",
        result.message
    );
}

#[tokio::test]
async fn execution_ids_may_not_contain_the_key_separator() {
    let service = DeploymentService::new(engine());
    for bad in ["rel/QA", ""] {
        let err = service
            .submit_deployment(request(bad, Environment::Development))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidExecutionId(ref id) if id == bad));
        assert!(matches!(service.get_execution_result(bad), Err(ServiceError::NotFound(_))));
    }
}
