use thiserror::Error;

/// Vigil-specific error types
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Cluster not found: {cluster}")]
    ClusterNotFound { cluster: String },

    #[error("Probe failed on {node_id}: {reason}")]
    ProbeFailed { node_id: String, reason: String },

    #[error("Precondition unmet ({code}): {reason}")]
    PreconditionUnmet { code: &'static str, reason: String },

    #[error("Plan step failed: {step} - {reason}")]
    PlanStepFailed { step: String, reason: String },

    #[error("Election produced no candidates")]
    NoCandidates,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Arbitration error: {0}")]
    ArbitrationError(String),

    #[error("Proxy error on {proxy_id}: {reason}")]
    ProxyError { proxy_id: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<String> for VigilError {
    fn from(msg: String) -> Self {
        VigilError::Internal(msg)
    }
}

impl From<&str> for VigilError {
    fn from(msg: &str) -> Self {
        VigilError::Internal(msg.to_string())
    }
}

impl VigilError {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        VigilError::NetworkError(msg.into())
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        VigilError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        VigilError::ConfigurationError(msg.into())
    }

    pub fn arbitration<S: Into<String>>(msg: S) -> Self {
        VigilError::ArbitrationError(msg.into())
    }

    pub fn probe<N: Into<String>, S: Into<String>>(node_id: N, reason: S) -> Self {
        VigilError::ProbeFailed {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    pub fn precondition(code: &'static str, reason: impl Into<String>) -> Self {
        VigilError::PreconditionUnmet {
            code,
            reason: reason.into(),
        }
    }

    pub fn plan_step<T: Into<String>, S: Into<String>>(step: T, reason: S) -> Self {
        VigilError::PlanStepFailed {
            step: step.into(),
            reason: reason.into(),
        }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        VigilError::Internal(msg.into())
    }
}

/// Result type for Vigil operations
pub type VigilResult<T> = Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = VigilError::network("Connection refused");
        assert!(matches!(error, VigilError::NetworkError(_)));
        assert_eq!(error.to_string(), "Network error: Connection refused");
    }

    #[test]
    fn test_precondition_error_carries_code() {
        let error = VigilError::precondition("ERR00029", "last failover 10s ago");
        assert_eq!(
            error.to_string(),
            "Precondition unmet (ERR00029): last failover 10s ago"
        );
        match error {
            VigilError::PreconditionUnmet { code, .. } => assert_eq!(code, "ERR00029"),
            _ => unreachable!("constructor guarantees PreconditionUnmet"),
        }
    }

    #[test]
    fn test_probe_error() {
        let error = VigilError::probe("c1-db1-3306", "connection timed out");
        assert!(error.to_string().contains("c1-db1-3306"));
        assert!(error.to_string().contains("timed out"));
    }

    #[test]
    fn test_timeout_constructor() {
        let error = VigilError::timeout("wait_apply");
        assert_eq!(error.to_string(), "Timeout: wait_apply");
    }
}
