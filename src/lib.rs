//! AppConsole Backend Library
//!
//! Application lifecycle on Kubernetes: templates rendered into per-application
//! namespaces, an informer cache of the cluster, and status reconciliation.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod k8s;
pub mod models;
pub mod service;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the ops router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health::health_check))
        .route("/api/cluster/status", get(api::health::cluster_status))
        .route("/api/cluster/nodes", get(api::health::list_nodes))
        .route("/api/cluster/namespaces", get(api::health::list_namespaces))
        .route("/metrics", get(api::metrics::metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
