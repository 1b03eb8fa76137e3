//! Deployment service error types.

use thiserror::Error;

/// Errors returned to callers of `DeploymentService`.
///
/// Stage failures are never errors; they are recorded in the execution
/// result. These cover caller mistakes only.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("execution already submitted: {0}")]
    Duplicate(String),

    #[error("invalid execution id {0:?}: must be non-empty and must not contain '/'")]
    InvalidExecutionId(String),

    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("execution task failed: {0}")]
    Join(String),

    #[error("approval error: {0}")]
    Approval(#[from] shipgate_approval::ApprovalError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
