use axum::{extract::State, Json};
use serde::Serialize;

use crate::api::response::ApiResponse;
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::k8s::status::{node_address, node_is_ready};
use crate::k8s::{CacheSummary, K8sClient};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ClusterStatusResponse {
    pub connected: bool,
    pub message: String,
    pub cache: CacheSummary,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    pub address: Option<String>,
    pub ready: bool,
    pub kubelet_version: Option<String>,
}

#[derive(Serialize)]
pub struct NamespaceInfo {
    pub name: String,
    pub phase: Option<String>,
    pub owner: Option<String>,
    pub application: Option<String>,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Kubernetes connection and cache status
pub async fn cluster_status(
    State(state): State<AppState>,
) -> Json<ApiResponse<ClusterStatusResponse>> {
    let connected = state.k8s.read().await.is_some();
    let message = if connected {
        "Kubernetes cluster connected".to_string()
    } else {
        "Kubernetes cluster not available".to_string()
    };

    Json(ApiResponse::success(ClusterStatusResponse {
        connected,
        message,
        cache: state.cache.summary().await,
    }))
}

async fn connected(state: &AppState) -> AppResult<K8sClient> {
    state
        .k8s
        .read()
        .await
        .clone()
        .ok_or_else(|| AppError::Unavailable("Kubernetes cluster not available".to_string()))
}

/// Cluster nodes, from the cache when it has synced
pub async fn list_nodes(State(state): State<AppState>) -> AppResult<Json<ApiResponse<Vec<NodeInfo>>>> {
    let nodes = if state.cache.is_synced().await {
        state.cache.nodes().await
    } else {
        connected(&state).await?.list_nodes().await?
    };

    let nodes = nodes
        .iter()
        .map(|node| NodeInfo {
            name: node.metadata.name.clone().unwrap_or_default(),
            address: node_address(node),
            ready: node_is_ready(node),
            kubelet_version: node
                .status
                .as_ref()
                .and_then(|s| s.node_info.as_ref())
                .map(|info| info.kubelet_version.clone()),
        })
        .collect();

    Ok(Json(ApiResponse::success(nodes)))
}

/// Namespaces created for applications
pub async fn list_namespaces(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<NamespaceInfo>>>> {
    if !state.cache.is_synced().await {
        return Err(AppError::Unavailable("cluster cache not synced".to_string()));
    }

    let namespaces = state
        .cache
        .namespaces()
        .await
        .into_iter()
        .map(|ns| {
            let label = |key: &str| ns.metadata.labels.as_ref().and_then(|l| l.get(key)).cloned();
            NamespaceInfo {
                name: ns.metadata.name.clone().unwrap_or_default(),
                phase: ns.status.as_ref().and_then(|s| s.phase.clone()),
                owner: label(crate::k8s::manifest::LABEL_OWNER),
                application: label(crate::k8s::manifest::LABEL_APPLICATION),
            }
        })
        .collect();

    Ok(Json(ApiResponse::success(namespaces)))
}
