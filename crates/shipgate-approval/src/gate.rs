//! Approval gate — create, decide, wait, and expire approval requests.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use shipgate_core::{
    ApprovalSettings, CancelSignal, ConfigError, DeploymentRequest, Environment, epoch_millis,
};
use shipgate_state::{ApprovalRequest, ApprovalStatus, StateStore};

use crate::error::{ApprovalError, ApprovalResult};
use crate::notify::{ApprovalEvent, ApprovalNotifier, NoopApprovalNotifier};

/// Approval gate settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalGateConfig {
    /// How long a request may stay pending.
    pub timeout: Duration,
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Approvers applied to requests that name none.
    pub default_approvers: Vec<String>,
}

impl Default for ApprovalGateConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(60),
            default_approvers: Vec::new(),
        }
    }
}

impl TryFrom<&ApprovalSettings> for ApprovalGateConfig {
    type Error = ConfigError;

    fn try_from(s: &ApprovalSettings) -> Result<Self, Self::Error> {
        Ok(Self {
            timeout: s.timeout()?,
            sweep_interval: s.sweep_interval()?,
            default_approvers: s.default_approvers.clone(),
        })
    }
}

/// Input for a new approval request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewApproval {
    /// Store key; one request per key.
    pub execution_id: String,
    pub module_name: String,
    pub module_version: String,
    pub environment: Environment,
    pub requested_by: String,
    pub approvers: Vec<String>,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
}

impl NewApproval {
    /// Approval of `request` for deploying to `environment`.
    pub fn for_request(request: &DeploymentRequest, environment: Environment) -> Self {
        Self {
            execution_id: request.execution_id.clone(),
            module_name: request.module.name.clone(),
            module_version: request.module.version.to_string(),
            environment,
            requested_by: request.requested_by.clone(),
            approvers: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.execution_id = key.into();
        self
    }

    pub fn with_approvers<I, S>(mut self, approvers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approvers = approvers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One live request plus the channel its waiters listen on.
struct ApprovalSlot {
    request: ApprovalRequest,
    status_tx: watch::Sender<ApprovalStatus>,
}

/// Manages approval requests for all executions.
pub struct ApprovalGate {
    config: ApprovalGateConfig,
    /// Requests by execution key. Entries are never removed.
    slots: DashMap<String, ApprovalSlot>,
    notifier: Arc<dyn ApprovalNotifier>,
    /// Optional durable mirror of every request.
    store: Option<StateStore>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalGateConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
            notifier: Arc::new(NoopApprovalNotifier),
            store: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Mirror every create and transition into the state store.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ApprovalGateConfig {
        &self.config
    }

    /// Open a new `Pending` request.
    ///
    /// Fails with `Duplicate` if any request, in any status, already exists
    /// for the key. The check and insert are a single atomic step.
    pub async fn create_request(&self, new: NewApproval) -> ApprovalResult<ApprovalRequest> {
        let now = epoch_millis();
        let timeout = new.timeout.unwrap_or(self.config.timeout);
        let approvers = if new.approvers.is_empty() {
            self.config.default_approvers.clone()
        } else {
            new.approvers
        };

        let request = ApprovalRequest {
            approval_id: uuid::Uuid::new_v4().to_string(),
            execution_id: new.execution_id,
            module_name: new.module_name,
            module_version: new.module_version,
            environment: new.environment,
            requested_by: new.requested_by,
            approvers,
            created_at_ms: now,
            timeout_at_ms: now.saturating_add(timeout.as_millis() as u64),
            status: ApprovalStatus::Pending,
            responded_by: None,
            reason: None,
            responded_at_ms: None,
        };

        match self.slots.entry(request.execution_id.clone()) {
            Entry::Occupied(_) => {
                warn!(execution_id = %request.execution_id, "duplicate approval request rejected");
                return Err(ApprovalError::Duplicate(request.execution_id));
            }
            Entry::Vacant(vacant) => {
                // Mirrored while the shard is still locked: no decision on this
                // key can reach the store before the Pending record does.
                self.persist(&request);
                let (status_tx, _) = watch::channel(ApprovalStatus::Pending);
                vacant.insert(ApprovalSlot {
                    request: request.clone(),
                    status_tx,
                });
            }
        }

        info!(
            execution_id = %request.execution_id,
            approval_id = %request.approval_id,
            environment = %request.environment,
            approvers = request.approvers.len(),
            ?timeout,
            "approval requested"
        );

        self.notify(ApprovalEvent::Requested, &request).await;
        Ok(request)
    }

    /// Approve or reject a pending request.
    pub async fn decide(
        &self,
        execution_id: &str,
        approver: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> ApprovalResult<ApprovalRequest> {
        let updated = {
            let mut slot = self
                .slots
                .get_mut(execution_id)
                .ok_or_else(|| ApprovalError::NotFound(execution_id.to_string()))?;

            if !slot.request.is_authorized(approver) {
                warn!(%execution_id, %approver, "unauthorized approval decision");
                return Err(ApprovalError::Unauthorized {
                    execution_id: execution_id.to_string(),
                    approver: approver.to_string(),
                });
            }
            if slot.request.status.is_terminal() {
                return Err(ApprovalError::AlreadyResolved {
                    execution_id: execution_id.to_string(),
                    status: slot.request.status,
                });
            }

            let status = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            slot.request.status = status;
            slot.request.responded_by = Some(approver.to_string());
            slot.request.reason = reason.map(str::to_string);
            slot.request.responded_at_ms = Some(epoch_millis());
            slot.status_tx.send_replace(status);
            slot.request.clone()
        };

        info!(%execution_id, %approver, status = ?updated.status, "approval decided");

        let event = if approved {
            ApprovalEvent::Approved
        } else {
            ApprovalEvent::Rejected
        };
        self.persist(&updated);
        self.notify(event, &updated).await;
        Ok(updated)
    }

    /// Suspend until the request reaches a terminal status.
    ///
    /// No task is parked on a timer: the waiter is woken by `decide` or
    /// `sweep_expired`, or returns `Cancelled` when `cancel` fires.
    pub async fn wait_for_decision(
        &self,
        execution_id: &str,
        cancel: &CancelSignal,
    ) -> ApprovalResult<ApprovalRequest> {
        let mut status_rx = self
            .slots
            .get(execution_id)
            .map(|slot| slot.status_tx.subscribe())
            .ok_or_else(|| ApprovalError::NotFound(execution_id.to_string()))?;

        debug!(%execution_id, "waiting for approval decision");

        tokio::select! {
            resolved = status_rx.wait_for(|status| status.is_terminal()) => {
                resolved
                    .map(|_| ())
                    .map_err(|_| ApprovalError::Closed(execution_id.to_string()))?;
            }
            _ = cancel.cancelled() => {
                info!(%execution_id, "approval wait cancelled");
                return Err(ApprovalError::Cancelled(execution_id.to_string()));
            }
        }

        self.get(execution_id)
            .ok_or_else(|| ApprovalError::NotFound(execution_id.to_string()))
    }

    /// Expire every pending request past its timeout. Returns how many expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = epoch_millis();
        let overdue: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.request.is_overdue_at(now))
            .map(|slot| slot.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for key in overdue {
            let Some(mut slot) = self.slots.get_mut(&key) else {
                continue;
            };
            // A decision may have landed since the scan.
            if !slot.request.is_overdue_at(now) {
                continue;
            }
            let waited = Duration::from_millis(
                slot.request
                    .timeout_at_ms
                    .saturating_sub(slot.request.created_at_ms),
            );
            slot.request.status = ApprovalStatus::Expired;
            slot.request.reason = Some(format!("approval timed out after {waited:?}"));
            slot.request.responded_at_ms = Some(now);
            slot.status_tx.send_replace(ApprovalStatus::Expired);
            expired.push(slot.request.clone());
        }

        for request in &expired {
            info!(execution_id = %request.execution_id, "approval expired");
            self.persist(request);
            self.notify(ApprovalEvent::Expired, request).await;
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "expiry sweep finished");
        }
        expired.len()
    }

    /// Run `sweep_expired` every `sweep_interval` until `shutdown` fires.
    pub async fn run_sweeper(&self, shutdown: CancelSignal) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.sweep_interval, "approval sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_expired().await;
                }
                _ = shutdown.cancelled() => {
                    info!("approval sweeper stopped");
                    break;
                }
            }
        }
    }

    /// All requests still pending, oldest first.
    pub fn get_pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .slots
            .iter()
            .filter(|slot| slot.request.status == ApprovalStatus::Pending)
            .map(|slot| slot.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at_ms);
        pending
    }

    /// Look up a request by execution key.
    pub fn get(&self, execution_id: &str) -> Option<ApprovalRequest> {
        self.slots.get(execution_id).map(|slot| slot.request.clone())
    }

    /// Look up a request by its approval id.
    pub fn get_by_id(&self, approval_id: &str) -> Option<ApprovalRequest> {
        self.slots
            .iter()
            .find(|slot| slot.request.approval_id == approval_id)
            .map(|slot| slot.request.clone())
    }

    fn persist(&self, request: &ApprovalRequest) {
        if let Some(store) = &self.store {
            match store.put_approval(request) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(execution_id = %request.execution_id, status = ?request.status, "stored approval already decided");
                }
                Err(e) => {
                    warn!(execution_id = %request.execution_id, error = %e, "failed to persist approval");
                }
            }
        }
    }

    async fn notify(&self, event: ApprovalEvent, request: &ApprovalRequest) {
        if let Err(e) = self.notifier.notify(event, request).await {
            warn!(
                execution_id = %request.execution_id,
                ?event,
                error = %e,
                "approval notification failed"
            );
        }
    }
}
