//! Orchestrator error types.

use thiserror::Error;

use labvm_cluster::{ClusterError, TemplateError};

/// Why a lifecycle operation could not be applied.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("manifest error: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl DispatchError {
    /// Retrying cannot succeed: the message goes to the dead letters
    /// instead of back to the head of the queue.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidOperation(_) | DispatchError::Template(_)
        )
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_and_payload_errors_are_permanent() {
        assert!(DispatchError::InvalidOperation("empty name".into()).is_permanent());
        assert!(DispatchError::Template(TemplateError::MissingPlaceholder).is_permanent());
    }

    #[test]
    fn cluster_errors_are_transient() {
        assert!(!DispatchError::Cluster(ClusterError::Other("timeout".into())).is_permanent());
        assert!(!DispatchError::Cluster(ClusterError::Connect("no route".into())).is_permanent());
    }
}
