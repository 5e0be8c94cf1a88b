pub mod health;
pub mod metrics;
pub mod response;

use crate::config::Config;
use crate::db::Database;
use crate::k8s::{CacheManager, K8sClient};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub event_tx: broadcast::Sender<Event>,
    pub k8s: Arc<RwLock<Option<K8sClient>>>,
    pub cache: CacheManager,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let cache = CacheManager::new(event_tx.clone());
        Self {
            db,
            config,
            event_tx,
            k8s: Arc::new(RwLock::new(None)),
            cache,
            metrics: None,
        }
    }

    pub async fn set_k8s(&self, k8s: K8sClient) {
        let mut guard = self.k8s.write().await;
        *guard = Some(k8s);
    }

    pub async fn clear_k8s(&self) {
        let mut guard = self.k8s.write().await;
        *guard = None;
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Events broadcast by the cache and the reconciler
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    #[serde(rename = "resource:applied")]
    ResourceApplied { kind: String, key: String },
    #[serde(rename = "resource:deleted")]
    ResourceDeleted { kind: String, key: String },
    #[serde(rename = "cache:resynced")]
    CacheResynced { kind: String, count: usize },
    #[serde(rename = "app:status_changed")]
    AppStatusChanged {
        app_id: String,
        status: String,
        message: Option<String>,
    },
}
