//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::{api::Api, ResourceExt};
use tracing::{error, instrument};

use crate::controller::ControllerState;
use crate::crd::VaultCluster;

use super::dto::{
    ClusterDetailResponse, ClusterListResponse, ClusterSummary, ErrorResponse, HealthResponse,
};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub(crate) fn summarize(cluster: &VaultCluster) -> ClusterSummary {
    let status = cluster.status.clone().unwrap_or_default();
    ClusterSummary {
        name: cluster.name_any(),
        namespace: cluster.namespace().unwrap_or_default(),
        phase: status.phase,
        replicas: cluster.spec.replicas,
        available: status.available_count(),
        active_node: status.active_node,
    }
}

/// List VaultClusters visible to the operator
#[instrument(skip(state))]
pub async fn list_clusters(
    State(state): State<Arc<ControllerState>>,
) -> Result<Json<ClusterListResponse>, ApiError> {
    let api: Api<VaultCluster> = match state.config.namespace.as_deref() {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };

    match api.list(&Default::default()).await {
        Ok(clusters) => {
            let items: Vec<ClusterSummary> = clusters.items.iter().map(summarize).collect();
            let total = items.len();
            Ok(Json(ClusterListResponse { items, total }))
        }
        Err(e) => {
            error!("Failed to list clusters: {:?}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("list_failed", &e.to_string())),
            ))
        }
    }
}

/// Status view of one VaultCluster
#[instrument(skip(state), fields(name = %name, namespace = %namespace))]
pub async fn get_cluster(
    State(state): State<Arc<ControllerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ClusterDetailResponse>, ApiError> {
    let api: Api<VaultCluster> = Api::namespaced(state.client.clone(), &namespace);

    match api.get(&name).await {
        Ok(cluster) => Ok(Json(ClusterDetailResponse {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
            version: cluster.spec.version.clone(),
            replicas: cluster.spec.replicas,
            status: cluster.status.clone().unwrap_or_default(),
            created_at: cluster
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
        })),
        Err(kube::Error::Api(e)) if e.code == 404 => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "not_found",
                &format!("VaultCluster {}/{} not found", namespace, name),
            )),
        )),
        Err(e) => {
            error!("Failed to get cluster {}/{}: {:?}", namespace, name, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("get_failed", &e.to_string())),
            ))
        }
    }
}
