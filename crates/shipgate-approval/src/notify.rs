//! Approval notifications.

use async_trait::async_trait;

use shipgate_state::ApprovalRequest;

/// Which lifecycle step a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalEvent {
    Requested,
    Approved,
    Rejected,
    Expired,
}

/// Tells approvers and requesters about approval lifecycle changes.
///
/// Failures are logged by the gate and never undo the transition.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, event: ApprovalEvent, request: &ApprovalRequest) -> anyhow::Result<()>;
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApprovalNotifier;

#[async_trait]
impl ApprovalNotifier for NoopApprovalNotifier {
    async fn notify(&self, _event: ApprovalEvent, _request: &ApprovalRequest) -> anyhow::Result<()> {
        Ok(())
    }
}
