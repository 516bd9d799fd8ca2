//! VaultCluster Custom Resource Definition
//!
//! A VaultCluster declares a highly-available group of Vault server
//! instances sharing one TLS trust domain.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Anomaly, ClusterPhase, Condition, ResourceRequirements, TlsConfig, TlsMode};

pub const DEFAULT_BASE_IMAGE: &str = "hashicorp/vault";

/// Structured validation error for `VaultClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vault.security.coreos.com",
    version = "v1alpha1",
    kind = "VaultCluster",
    namespaced,
    status = "VaultClusterStatus",
    shortname = "vc",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Active","type":"string","jsonPath":".status.activeNode"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultClusterSpec {
    /// Number of Vault instances; must be odd
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Vault server version, used as the image tag
    pub version: String,

    #[serde(default = "default_base_image")]
    pub base_image: String,

    #[serde(default)]
    pub tls_config: TlsConfig,

    /// Extra server configuration appended to the generated config,
    /// typically the storage and HA backend stanzas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_snippet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

fn default_replicas() -> i32 {
    1
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}

impl VaultClusterSpec {
    /// Validate the spec, returning every structural problem found
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.replicas < 1 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                format!("must be at least 1, got {}", self.replicas),
            ));
        } else if self.replicas % 2 == 0 {
            errors.push(SpecValidationError::new(
                "spec.replicas",
                format!("must be odd to keep a quorum, got {}", self.replicas),
            ));
        }

        if self.version.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.version",
                "must not be empty",
            ));
        }

        if self.base_image.trim().is_empty() {
            errors.push(SpecValidationError::new(
                "spec.baseImage",
                "must not be empty",
            ));
        }

        if self.tls_config.mode == TlsMode::External
            && self
                .tls_config
                .ca_secret_name
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            errors.push(SpecValidationError::new(
                "spec.tlsConfig.caSecretName",
                "is required when mode is External",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Fully qualified container image
    pub fn image(&self) -> String {
        format!("{}:{}", self.base_image, self.version)
    }
}

/// Observed state of a VaultCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Instances that answered the last probe
    #[serde(default)]
    pub available_nodes: Vec<String>,

    #[serde(default)]
    pub sealed_nodes: Vec<String>,

    #[serde(default)]
    pub standby_nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_node: Option<String>,

    /// Declared instances that did not answer the last probe
    #[serde(default)]
    pub unavailable_nodes: Vec<String>,

    #[serde(default)]
    pub anomalies: Vec<Anomaly>,

    /// Set once any instance has been seen initialized or unsealed
    #[serde(default)]
    pub initialized: bool,

    /// Ordinal the next created instance will receive
    #[serde(default)]
    pub next_ordinal: i32,

    /// SHA-256 fingerprint of the cluster CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<String>,
}

impl VaultClusterStatus {
    /// Number of instances currently answering probes
    pub fn available_count(&self) -> usize {
        self.available_nodes.len()
    }

    pub fn has_split_brain(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| a.kind == super::types::AnomalyKind::SplitBrain)
    }
}
