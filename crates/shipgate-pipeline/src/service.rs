//! Deployment service — the caller-facing entry point.
//!
//! Each submitted request runs as its own tokio task. The service keeps a
//! cancel handle and a completion channel per execution, plus an
//! `ExecutionCache` fed by the engine for in-flight views.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::info;

use shipgate_core::{CancelHandle, DeploymentRequest, ExecutionId, cancel_pair};
use shipgate_state::{
    ApprovalRequest, ApprovalStatus, ExecutionSnapshot, ExecutionState, PipelineExecutionResult,
};

use crate::engine::{APPROVAL_KEY_SEPARATOR, PipelineEngine};
use crate::error::{ServiceError, ServiceResult};
use crate::observers::ExecutionCache;

struct ExecutionSlot {
    cancel: CancelHandle,
    done: watch::Receiver<Option<PipelineExecutionResult>>,
}

/// Submits, tracks, and controls pipeline executions.
pub struct DeploymentService {
    engine: Arc<PipelineEngine>,
    cache: Arc<ExecutionCache>,
    executions: DashMap<ExecutionId, ExecutionSlot>,
}

impl DeploymentService {
    pub fn new(engine: PipelineEngine) -> Self {
        let cache = Arc::new(ExecutionCache::new());
        let engine = engine.with_tracker(cache.clone());
        Self {
            engine: Arc::new(engine),
            cache,
            executions: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    /// Start a pipeline for `request` and return its execution id.
    ///
    /// Must be called from within a tokio runtime. Execution ids are
    /// single-use: resubmitting one fails even after it finished. `/` is
    /// reserved for per-environment approval keys and rejected in ids.
    pub fn submit_deployment(&self, request: DeploymentRequest) -> ServiceResult<ExecutionId> {
        let execution_id = request.execution_id.clone();
        if execution_id.is_empty() || execution_id.contains(APPROVAL_KEY_SEPARATOR) {
            return Err(ServiceError::InvalidExecutionId(execution_id));
        }
        let (handle, signal) = cancel_pair();
        let (done_tx, done_rx) = watch::channel(None);

        match self.executions.entry(execution_id.clone()) {
            Entry::Occupied(_) => return Err(ServiceError::Duplicate(execution_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(ExecutionSlot {
                    cancel: handle,
                    done: done_rx,
                });
            }
        }

        self.cache.apply(&ExecutionSnapshot::new(
            ExecutionState::Running,
            None,
            &PipelineExecutionResult::new(&execution_id, ""),
        ));

        info!(
            %execution_id,
            module = %request.module.name,
            target = %request.target,
            requested_by = %request.requested_by,
            "deployment submitted"
        );

        let engine = self.engine.clone();
        tokio::spawn(async move {
            let result = engine.execute(&request, &signal).await;
            done_tx.send_replace(Some(result));
        });

        Ok(execution_id)
    }

    /// The final result if finished, otherwise the latest partial result.
    pub fn get_execution_result(&self, execution_id: &str) -> ServiceResult<PipelineExecutionResult> {
        let slot = self
            .executions
            .get(execution_id)
            .ok_or_else(|| ServiceError::NotFound(execution_id.to_string()))?;

        if let Some(result) = slot.done.borrow().as_ref() {
            return Ok(result.clone());
        }
        self.cache
            .get(execution_id)
            .map(|snapshot| snapshot.result)
            .ok_or_else(|| ServiceError::NotFound(execution_id.to_string()))
    }

    /// Latest published snapshot, including the pipeline state.
    pub fn get_execution_state(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.cache.get(execution_id)
    }

    /// Approve or reject the open approval of an execution.
    ///
    /// `execution_id` may name the execution or a specific approval key.
    pub async fn decide_approval(
        &self,
        execution_id: &str,
        approver: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> ServiceResult<ApprovalRequest> {
        let key = self.approval_key(execution_id);
        Ok(self
            .engine
            .approvals()
            .decide(&key, approver, approved, reason)
            .await?)
    }

    /// Every approval still waiting for a decision, oldest first.
    pub fn get_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.engine.approvals().get_pending()
    }

    /// Cancel a running execution. No-op once it has finished.
    pub fn cancel(&self, execution_id: &str) -> ServiceResult<()> {
        let slot = self
            .executions
            .get(execution_id)
            .ok_or_else(|| ServiceError::NotFound(execution_id.to_string()))?;
        if slot.done.borrow().is_none() {
            info!(%execution_id, "cancelling execution");
            slot.cancel.cancel();
        }
        Ok(())
    }

    /// Wait until the execution finishes and return its result.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
    ) -> ServiceResult<PipelineExecutionResult> {
        let mut done = self
            .executions
            .get(execution_id)
            .map(|slot| slot.done.clone())
            .ok_or_else(|| ServiceError::NotFound(execution_id.to_string()))?;

        let finished = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ServiceError::Join(execution_id.to_string()))?;
        finished
            .clone()
            .ok_or_else(|| ServiceError::Join(execution_id.to_string()))
    }

    /// Resolve the approval key a decision on `execution_id` refers to.
    ///
    /// Upfront gates are keyed by the execution id itself; per-environment
    /// gates by `{execution_id}/{environment}`. The pending one wins.
    fn approval_key(&self, execution_id: &str) -> String {
        let gate = self.engine.approvals();
        if let Some(request) = gate.get(execution_id) {
            if request.status == ApprovalStatus::Pending {
                return execution_id.to_string();
            }
        }
        let prefix = format!("{execution_id}{APPROVAL_KEY_SEPARATOR}");
        gate.get_pending()
            .into_iter()
            .find(|r| r.execution_id.starts_with(&prefix))
            .map(|r| r.execution_id)
            .unwrap_or_else(|| execution_id.to_string())
    }
}
