use pagewatch_core::{DomainError, TenantContextError};

use crate::collaborators::CaptureError;
use crate::jobs::{OrchestratorError, QueueError};
use crate::tenancy::StoreError;

/// Capture lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Collaborator(#[from] CaptureError),
}

impl From<TenantContextError> for LifecycleError {
    fn from(value: TenantContextError) -> Self {
        LifecycleError::Store(StoreError::TenantIsolation(value))
    }
}

impl LifecycleError {
    /// Whether a job hitting this error should be retried.
    ///
    /// Storage failures are terminal for the job; only a lost optimistic
    /// write race is retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LifecycleError::Store(StoreError::Conflict(_)) => true,
            LifecycleError::Orchestrator(OrchestratorError::Queue(QueueError::Backend(_))) => true,
            LifecycleError::Collaborator(err) => err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_failures_do_not_retry() {
        assert!(!LifecycleError::from(StoreError::Backend("connection reset".into())).is_transient());
        assert!(LifecycleError::from(StoreError::Conflict("version moved".into())).is_transient());
        assert!(!LifecycleError::from(DomainError::NotFound).is_transient());
    }
}
