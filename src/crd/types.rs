//! Shared types used by the VaultCluster custom resource

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the cluster's certificate authority is provisioned
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TlsMode {
    /// The operator generates and owns a per-cluster CA
    #[default]
    SelfSigned,
    /// The CA certificate and key are supplied in an existing Secret
    External,
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::SelfSigned => write!(f, "SelfSigned"),
            TlsMode::External => write!(f, "External"),
        }
    }
}

/// TLS configuration for the cluster's trust domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,

    /// Secret holding `tls.crt` and `tls.key` of the external CA.
    /// Required when `mode` is `External`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

/// Compute resources for the server container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceSpec>,
}

/// CPU and memory quantities, e.g. `500m` / `1Gi`
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
}

/// Aggregated lifecycle phase of the whole cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// No instance has been initialized yet
    #[default]
    Initializing,
    /// Every reachable instance is sealed
    Sealed,
    /// Some instances are unsealed, or no leader has been elected yet
    Unsealing,
    /// One active instance and the full replica count answering
    Running,
    /// Split-brain, or fewer instances answering than declared
    Degraded,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterPhase::Initializing => "Initializing",
            ClusterPhase::Sealed => "Sealed",
            ClusterPhase::Unsealing => "Unsealing",
            ClusterPhase::Running => "Running",
            ClusterPhase::Degraded => "Degraded",
        };
        write!(f, "{s}")
    }
}

/// Category of a reported anomaly
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AnomalyKind {
    /// More than one instance claims leadership
    SplitBrain,
    /// The spec is structurally invalid
    Validation,
    /// The configured CA issuer cannot be used
    Tls,
}

/// Something the operator observed but will not resolve on its own
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub message: String,
    /// Instances involved, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl Anomaly {
    pub fn split_brain(nodes: Vec<String>) -> Self {
        Self {
            kind: AnomalyKind::SplitBrain,
            message: format!(
                "{} instances report themselves active: {}",
                nodes.len(),
                nodes.join(", ")
            ),
            nodes,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: AnomalyKind::Validation,
            message: message.into(),
            nodes: Vec::new(),
        }
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self {
            kind: AnomalyKind::Tls,
            message: message.into(),
            nodes: Vec::new(),
        }
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Degraded")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
