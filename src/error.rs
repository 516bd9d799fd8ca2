//! Central error types for the Vault operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use std::time::Duration;

use thiserror::Error;

/// Central error type for the Vault operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Operator configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Cluster spec validation error
    #[error("Cluster validation error: {0}")]
    ValidationError(String),

    /// TLS material could not be generated, read or parsed
    #[error("TLS error: {0}")]
    Tls(String),

    /// The configured CA issuer is missing or unusable. Needs an operator fix.
    #[error("TLS issuer error: {0}")]
    TlsIssuer(String),

    /// HTTP client error (from reqwest)
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The reconcile pass ran past its outer deadline
    #[error("Reconcile pass exceeded deadline of {0:?}")]
    PassTimeout(Duration),

    /// Status write kept losing the resourceVersion race
    #[error("Status update conflicted {attempts} times in a row")]
    StatusConflict { attempts: u32 },

    /// Object is missing the name or namespace needed to address it
    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Transient errors are retried on the next tick and never surfaced as fatal
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::HttpError(_)
                | Error::PassTimeout(_)
                | Error::StatusConflict { .. }
        )
    }

    /// True when the API server rejected a write because of a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// Short category used as a metric label
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::Tls(_) => "tls",
            Error::TlsIssuer(_) => "tls_issuer",
            Error::HttpError(_) => "http",
            Error::PassTimeout(_) => "timeout",
            Error::StatusConflict { .. } => "conflict",
            Error::MissingObjectKey(_) => "object",
        }
    }

    /// Convert to a human-readable message for status anomalies
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::ValidationError(msg) => format!("Validation failed: {}", msg),
            Error::Tls(msg) => format!("TLS material unavailable: {}", msg),
            Error::TlsIssuer(msg) => format!("CA issuer unusable: {}", msg),
            Error::HttpError(e) => format!("HTTP request failed: {}", e),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        }))
    }

    #[test]
    fn test_conflict_detection() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!Error::Tls("bad key".into()).is_conflict());
    }

    #[test]
    fn test_retriable_classification() {
        assert!(api_error(409).is_retriable());
        assert!(Error::PassTimeout(Duration::from_secs(60)).is_retriable());
        assert!(Error::StatusConflict { attempts: 5 }.is_retriable());
        assert!(!Error::Tls("corrupt CA key".into()).is_retriable());
        assert!(!Error::ValidationError("replicas must be odd".into()).is_retriable());
        assert!(!Error::TlsIssuer("secret vault-ca not found".into()).is_retriable());
    }

    #[test]
    fn test_metric_labels() {
        assert_eq!(api_error(500).metric_label(), "kube");
        assert_eq!(Error::Tls(String::new()).metric_label(), "tls");
        assert_eq!(Error::TlsIssuer(String::new()).metric_label(), "tls_issuer");
        assert_eq!(
            Error::StatusConflict { attempts: 1 }.metric_label(),
            "conflict"
        );
    }
}
