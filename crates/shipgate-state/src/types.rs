//! Domain types for pipeline executions, approvals, and audit events.
//!
//! These are the values the pipeline engine produces and the approval gate
//! mutates. All of them serialize to JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

use shipgate_core::{Environment, ExecutionId, epoch_millis};

// ── Stage results ──────────────────────────────────────────────────

/// Lifecycle of one pipeline stage: `Pending → Running → {Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Failed)
    }
}

/// Outcome of a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStageResult {
    pub name: String,
    pub status: StageStatus,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub message: String,
    /// Fault detail when the stage failed.
    pub error: Option<String>,
    /// Environment this stage acted on (deploy and per-environment approval).
    pub environment: Option<Environment>,
    /// Deploy stages only.
    pub strategy: Option<String>,
    pub nodes_succeeded: Option<u32>,
    pub nodes_failed: Option<u32>,
}

impl PipelineStageResult {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            started_at_ms: None,
            finished_at_ms: None,
            message: String::new(),
            error: None,
            environment: None,
            strategy: None,
            nodes_succeeded: None,
            nodes_failed: None,
        }
    }

    pub fn for_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// `Pending → Running`. Returns false if the stage already left `Pending`.
    pub fn start(&mut self) -> bool {
        if self.status != StageStatus::Pending {
            return false;
        }
        self.status = StageStatus::Running;
        self.started_at_ms = Some(epoch_millis());
        true
    }

    /// Move to `Succeeded`. Terminal stages are left untouched.
    pub fn succeed(&mut self, message: impl Into<String>) -> bool {
        self.finish(StageStatus::Succeeded, message.into(), None)
    }

    /// Move to `Failed`. Terminal stages are left untouched.
    pub fn fail(&mut self, message: impl Into<String>, error: Option<String>) -> bool {
        self.finish(StageStatus::Failed, message.into(), error)
    }

    fn finish(&mut self, status: StageStatus, message: String, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = epoch_millis();
        self.started_at_ms.get_or_insert(now);
        self.status = status;
        self.finished_at_ms = Some(now);
        self.message = message;
        self.error = error;
        true
    }

    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

// ── Execution results ──────────────────────────────────────────────

/// Aggregate outcome of one pipeline execution.
///
/// Stages are appended in execution order and never removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineExecutionResult {
    pub execution_id: ExecutionId,
    pub success: bool,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub trace_id: String,
    pub message: String,
    pub stages: Vec<PipelineStageResult>,
}

impl PipelineExecutionResult {
    pub fn new(execution_id: &str, trace_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            success: false,
            started_at_ms: epoch_millis(),
            finished_at_ms: None,
            trace_id: trace_id.to_string(),
            message: String::new(),
            stages: Vec::new(),
        }
    }

    pub fn push_stage(&mut self, stage: PipelineStageResult) {
        self.stages.push(stage);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at_ms.is_some()
    }

    /// Seal the result. A finished result is never reopened.
    pub fn finish(&mut self, success: bool, message: impl Into<String>) -> bool {
        if self.is_finished() {
            return false;
        }
        self.success = success;
        self.message = message.into();
        self.finished_at_ms = Some(epoch_millis());
        true
    }

    pub fn stage(&self, name: &str) -> Option<&PipelineStageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn failed_stage(&self) -> Option<&PipelineStageResult> {
        self.stages.iter().find(|s| s.is_failed())
    }
}

/// Pipeline-level state: `Running → (PendingApproval ⇄ Running) → {Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    PendingApproval,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Succeeded | ExecutionState::Failed)
    }
}

/// Point-in-time view of an execution, published to trackers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    pub current_stage: Option<String>,
    pub result: PipelineExecutionResult,
    pub updated_at_ms: u64,
}

impl ExecutionSnapshot {
    pub fn new(
        state: ExecutionState,
        current_stage: Option<&str>,
        result: &PipelineExecutionResult,
    ) -> Self {
        Self {
            execution_id: result.execution_id.clone(),
            state,
            current_stage: current_stage.map(str::to_string),
            result: result.clone(),
            updated_at_ms: epoch_millis(),
        }
    }
}

// ── Approvals ──────────────────────────────────────────────────────

/// Lifecycle of an approval request: `Pending → {Approved, Rejected, Expired}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }
}

/// A human approval gate for one execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub approval_id: String,
    /// Store key. One request per key, ever.
    pub execution_id: ExecutionId,
    pub module_name: String,
    pub module_version: String,
    pub environment: Environment,
    pub requested_by: String,
    /// Who may decide. Empty means anyone.
    pub approvers: Vec<String>,
    pub created_at_ms: u64,
    pub timeout_at_ms: u64,
    pub status: ApprovalStatus,
    pub responded_by: Option<String>,
    pub reason: Option<String>,
    pub responded_at_ms: Option<u64>,
}

impl ApprovalRequest {
    /// Whether `email` may decide on this request.
    pub fn is_authorized(&self, email: &str) -> bool {
        self.approvers.is_empty()
            || self
                .approvers
                .iter()
                .any(|a| a.trim().eq_ignore_ascii_case(email.trim()))
    }

    pub fn is_overdue_at(&self, now_ms: u64) -> bool {
        self.status == ApprovalStatus::Pending && now_ms >= self.timeout_at_ms
    }
}

// ── Audit ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    PipelineStarted,
    StageStarted,
    StageCompleted,
    ApprovalRequested,
    ApprovalResolved,
    PipelineCompleted,
}

/// One entry of an execution's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub execution_id: ExecutionId,
    pub kind: AuditEventKind,
    pub stage: Option<String>,
    pub message: String,
    pub recorded_at_ms: u64,
}

impl AuditEvent {
    pub fn new(execution_id: &str, kind: AuditEventKind, message: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            kind,
            stage: None,
            message: message.into(),
            recorded_at_ms: epoch_millis(),
        }
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }
}
