//! Approval gate error types.

use thiserror::Error;

use shipgate_state::ApprovalStatus;

/// Caller errors surfaced synchronously by the approval gate.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request already exists for execution {0}")]
    Duplicate(String),

    #[error("approval request not found for execution {0}")]
    NotFound(String),

    #[error("{approver} is not authorized to decide on execution {execution_id}")]
    Unauthorized {
        execution_id: String,
        approver: String,
    },

    #[error("approval for execution {execution_id} is already {status:?}")]
    AlreadyResolved {
        execution_id: String,
        status: ApprovalStatus,
    },

    #[error("wait for approval of execution {0} was cancelled")]
    Cancelled(String),

    #[error("approval gate closed while waiting on execution {0}")]
    Closed(String),
}

pub type ApprovalResult<T> = Result<T, ApprovalError>;
