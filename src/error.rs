//! Error types for the Kafka cluster operator.

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling clusters
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (health surface)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cluster ConfigMap could not be decoded into a cluster definition
    #[error("failed to decode cluster definition: {0}")]
    Decode(String),

    /// The requested update cannot be applied to a running cluster
    #[error("illegal cluster transition: {0}")]
    IllegalTransition(String),

    /// Lock acquisition for a cluster key timed out
    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    /// Invalid process configuration or environment
    #[error("configuration error: {0}")]
    Config(String),

    /// Observed state violates an operator invariant
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl OperatorError {
    /// Whether a failed operation is worth retrying on the next sweep.
    ///
    /// Decode and illegal-transition failures stay broken until the user
    /// edits the cluster ConfigMap, so retrying them has no value.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OperatorError::Kube(_)
                | OperatorError::Io(_)
                | OperatorError::LockTimeout(_)
                | OperatorError::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::Decode("missing field `kafka-storage`".to_string());
        assert!(err.to_string().contains("decode"));
        assert!(err.to_string().contains("kafka-storage"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(OperatorError::LockTimeout("lock::kafka::ns::c".to_string()).is_transient());
        assert!(!OperatorError::Decode("bad".to_string()).is_transient());
        assert!(!OperatorError::IllegalTransition("storage".to_string()).is_transient());
        assert!(!OperatorError::Config("bad labels".to_string()).is_transient());
    }
}
