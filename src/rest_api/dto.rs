//! Response bodies for the REST API

use serde::{Deserialize, Serialize};

use crate::crd::{ClusterPhase, VaultClusterStatus};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub namespace: String,
    pub phase: ClusterPhase,
    pub replicas: i32,
    pub available: usize,
    pub active_node: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetailResponse {
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub replicas: i32,
    pub status: VaultClusterStatus,
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
