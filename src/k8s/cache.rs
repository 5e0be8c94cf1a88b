//! Informer-backed mirror of the cluster objects the console reads
//!
//! One watcher per kind feeds a single lock-protected `ClusterState`. The
//! watch machinery (reconnects, relists) lives in kube-runtime; this module
//! only folds its events into maps and broadcasts what changed.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Service};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event as WatchEvent},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumIter, IntoEnumIterator};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::manifest::{LABEL_MANAGED_BY, MANAGED_BY_VALUE};
use super::client::K8sClient;
use super::status::ClusterView;
use crate::api::Event;

/// Kinds mirrored by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize)]
pub enum ResourceKind {
    Namespace,
    Service,
    Deployment,
    Node,
}

/// Local copy of cluster state, keyed by `namespace/name` or `name`
#[derive(Debug, Default)]
pub struct ClusterState {
    namespaces: HashMap<String, Namespace>,
    services: HashMap<String, Service>,
    deployments: HashMap<String, Deployment>,
    nodes: HashMap<String, Node>,
    synced: HashSet<ResourceKind>,
}

impl ClusterState {
    pub fn len(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Namespace => self.namespaces.len(),
            ResourceKind::Service => self.services.len(),
            ResourceKind::Deployment => self.deployments.len(),
            ResourceKind::Node => self.nodes.len(),
        }
    }

    pub fn is_synced(&self, kind: ResourceKind) -> bool {
        self.synced.contains(&kind)
    }
}

/// A Kubernetes type the cache knows where to store
pub trait Cached:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    const KIND: ResourceKind;

    fn bucket(state: &mut ClusterState) -> &mut HashMap<String, Self>;
}

impl Cached for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;

    fn bucket(state: &mut ClusterState) -> &mut HashMap<String, Self> {
        &mut state.namespaces
    }
}

impl Cached for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn bucket(state: &mut ClusterState) -> &mut HashMap<String, Self> {
        &mut state.services
    }
}

impl Cached for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn bucket(state: &mut ClusterState) -> &mut HashMap<String, Self> {
        &mut state.deployments
    }
}

impl Cached for Node {
    const KIND: ResourceKind = ResourceKind::Node;

    fn bucket(state: &mut ClusterState) -> &mut HashMap<String, Self> {
        &mut state.nodes
    }
}

pub fn cache_key<K: Resource>(obj: &K) -> String {
    match obj.meta().namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Fold one watch event into the state, returning what to broadcast
pub fn apply_event<K: Cached>(state: &mut ClusterState, event: WatchEvent<K>) -> Vec<Event> {
    let kind = K::KIND.to_string();

    match event {
        WatchEvent::Applied(obj) => {
            let key = cache_key(&obj);
            K::bucket(state).insert(key.clone(), obj);
            vec![Event::ResourceApplied { kind, key }]
        }
        WatchEvent::Deleted(obj) => {
            let key = cache_key(&obj);
            match K::bucket(state).remove(&key) {
                Some(_) => vec![Event::ResourceDeleted { kind, key }],
                None => vec![],
            }
        }
        WatchEvent::Restarted(objs) => {
            let bucket = K::bucket(state);
            bucket.clear();
            for obj in objs {
                bucket.insert(cache_key(&obj), obj);
            }
            let count = bucket.len();
            state.synced.insert(K::KIND);
            vec![Event::CacheResynced { kind, count }]
        }
    }
}

/// Object counts per kind
#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub namespaces: usize,
    pub services: usize,
    pub deployments: usize,
    pub nodes: usize,
    pub synced: bool,
}

/// Owns the informers and the shared state they feed
#[derive(Clone)]
pub struct CacheManager {
    state: Arc<RwLock<ClusterState>>,
    event_tx: broadcast::Sender<Event>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CacheManager {
    pub fn new(event_tx: broadcast::Sender<Event>) -> Self {
        Self {
            state: Arc::new(RwLock::new(ClusterState::default())),
            event_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start one watcher per kind; a running set is replaced
    pub async fn start(&self, client: Client) {
        self.stop().await;

        let managed = format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE);
        let handles = vec![
            self.spawn_informer(Api::<Namespace>::all(client.clone()), Some(&managed)),
            self.spawn_informer(Api::<Service>::all(client.clone()), Some(&managed)),
            self.spawn_informer(Api::<Deployment>::all(client.clone()), Some(&managed)),
            self.spawn_informer(Api::<Node>::all(client), None),
        ];

        self.tasks.lock().await.extend(handles);
        info!("Cache informers started");
    }

    /// Abort the informers and forget everything they collected
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        for handle in tasks.drain(..) {
            handle.abort();
        }
        *self.state.write().await = ClusterState::default();
        info!("Cache informers stopped");
    }

    fn spawn_informer<K: Cached>(&self, api: Api<K>, labels: Option<&str>) -> JoinHandle<()> {
        let mut config = watcher::Config::default();
        if let Some(labels) = labels {
            config = config.labels(labels);
        }
        let manager = self.clone();

        tokio::spawn(async move {
            info!(kind = %K::KIND, "Starting informer");
            let mut stream = watcher::watcher(api, config).default_backoff().boxed();

            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => manager.apply(event).await,
                    Err(e) => {
                        // Backoff and relist are handled by the watcher
                        error!(kind = %K::KIND, "Informer error: {}", e);
                    }
                }
            }

            warn!(kind = %K::KIND, "Informer stream ended");
        })
    }

    /// Apply a watch event and publish the resulting notifications
    pub async fn apply<K: Cached>(&self, event: WatchEvent<K>) {
        let (events, count) = {
            let mut state = self.state.write().await;
            let events = apply_event(&mut state, event);
            (events, state.len(K::KIND))
        };

        metrics::gauge!("appconsole_cache_objects", count as f64, "kind" => K::KIND.to_string());

        for event in events {
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }
    }

    pub async fn is_synced(&self) -> bool {
        let state = self.state.read().await;
        ResourceKind::iter().all(|kind| state.is_synced(kind))
    }

    pub async fn summary(&self) -> CacheSummary {
        let state = self.state.read().await;
        CacheSummary {
            namespaces: state.namespaces.len(),
            services: state.services.len(),
            deployments: state.deployments.len(),
            nodes: state.nodes.len(),
            synced: ResourceKind::iter().all(|kind| state.is_synced(kind)),
        }
    }

    pub async fn namespace(&self, name: &str) -> Option<Namespace> {
        self.state.read().await.namespaces.get(name).cloned()
    }

    pub async fn namespaces(&self) -> Vec<Namespace> {
        let state = self.state.read().await;
        sorted_by_key(&state.namespaces, |_| true)
    }

    pub async fn services_in(&self, namespace: &str) -> Vec<Service> {
        let state = self.state.read().await;
        sorted_by_key(&state.services, |key| in_namespace(key, namespace))
    }

    pub async fn deployments_in(&self, namespace: &str) -> Vec<Deployment> {
        let state = self.state.read().await;
        sorted_by_key(&state.deployments, |key| in_namespace(key, namespace))
    }

    pub async fn nodes(&self) -> Vec<Node> {
        let state = self.state.read().await;
        sorted_by_key(&state.nodes, |_| true)
    }
}

fn in_namespace(key: &str, namespace: &str) -> bool {
    key.split_once('/').map(|(ns, _)| ns) == Some(namespace)
}

fn sorted_by_key<T: Clone>(map: &HashMap<String, T>, keep: impl Fn(&str) -> bool) -> Vec<T> {
    let mut entries: Vec<_> = map.iter().filter(|(key, _)| keep(key)).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, v)| v.clone()).collect()
}

#[async_trait]
impl ClusterView for CacheManager {
    async fn namespace_phase(&self, namespace: &str) -> anyhow::Result<Option<String>> {
        Ok(self.namespace(namespace).await.map(|ns| {
            ns.status
                .and_then(|s| s.phase)
                .unwrap_or_else(|| "Active".to_string())
        }))
    }

    async fn deployments(&self, namespace: &str) -> anyhow::Result<Vec<Deployment>> {
        Ok(self.deployments_in(namespace).await)
    }

    async fn services(&self, namespace: &str) -> anyhow::Result<Vec<Service>> {
        Ok(self.services_in(namespace).await)
    }

    async fn nodes(&self) -> anyhow::Result<Vec<Node>> {
        Ok(CacheManager::nodes(self).await)
    }
}

/// Reads from the cache once it has synced, from the API server before that
/// or when caching is disabled
#[derive(Clone)]
pub struct ClusterReader {
    cache: Option<CacheManager>,
    client: K8sClient,
}

impl ClusterReader {
    pub fn new(cache: Option<CacheManager>, client: K8sClient) -> Self {
        Self { cache, client }
    }

    async fn synced_cache(&self) -> Option<&CacheManager> {
        match &self.cache {
            Some(cache) if cache.is_synced().await => Some(cache),
            _ => None,
        }
    }
}

#[async_trait]
impl ClusterView for ClusterReader {
    async fn namespace_phase(&self, namespace: &str) -> anyhow::Result<Option<String>> {
        match self.synced_cache().await {
            Some(cache) => cache.namespace_phase(namespace).await,
            None => self.client.namespace_phase(namespace).await,
        }
    }

    async fn deployments(&self, namespace: &str) -> anyhow::Result<Vec<Deployment>> {
        match self.synced_cache().await {
            Some(cache) => ClusterView::deployments(cache, namespace).await,
            None => self.client.list_deployments(namespace).await,
        }
    }

    async fn services(&self, namespace: &str) -> anyhow::Result<Vec<Service>> {
        match self.synced_cache().await {
            Some(cache) => ClusterView::services(cache, namespace).await,
            None => self.client.list_services(namespace).await,
        }
    }

    async fn nodes(&self) -> anyhow::Result<Vec<Node>> {
        match self.synced_cache().await {
            Some(cache) => ClusterView::nodes(cache).await,
            None => self.client.list_nodes().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::status::fixtures::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key(&deployment("apps", "web", 1, 1)), "apps/web");
        assert_eq!(cache_key(&node("worker-1", "10.0.0.1", true)), "worker-1");
    }

    #[test]
    fn test_applied_and_deleted() {
        let mut state = ClusterState::default();

        let events = apply_event(&mut state, WatchEvent::Applied(deployment("apps", "web", 1, 0)));
        assert!(matches!(&events[0], Event::ResourceApplied { key, .. } if key == "apps/web"));
        assert_eq!(state.len(ResourceKind::Deployment), 1);

        // A newer version replaces the old one
        apply_event(&mut state, WatchEvent::Applied(deployment("apps", "web", 1, 1)));
        assert_eq!(state.len(ResourceKind::Deployment), 1);
        assert_eq!(
            state.deployments["apps/web"].status.as_ref().unwrap().ready_replicas,
            Some(1)
        );

        let events = apply_event(&mut state, WatchEvent::Deleted(deployment("apps", "web", 1, 1)));
        assert!(matches!(&events[0], Event::ResourceDeleted { .. }));
        assert_eq!(state.len(ResourceKind::Deployment), 0);

        // Deleting something unknown is silent
        let events = apply_event(&mut state, WatchEvent::Deleted(deployment("apps", "web", 1, 1)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_restarted_replaces_bucket_and_marks_synced() {
        let mut state = ClusterState::default();
        apply_event(&mut state, WatchEvent::Applied(namespace("stale", "Active")));
        assert!(!state.is_synced(ResourceKind::Namespace));

        let events = apply_event(
            &mut state,
            WatchEvent::Restarted(vec![namespace("a", "Active"), namespace("b", "Terminating")]),
        );

        assert!(matches!(&events[0], Event::CacheResynced { count: 2, .. }));
        assert!(state.is_synced(ResourceKind::Namespace));
        assert!(!state.namespaces.contains_key("stale"));
        assert!(!state.is_synced(ResourceKind::Node));
    }

    #[tokio::test]
    async fn test_manager_queries_and_broadcast() {
        let (tx, mut rx) = broadcast::channel(16);
        let cache = CacheManager::new(tx);

        cache.apply(WatchEvent::Applied(namespace("apps", "Active"))).await;
        cache.apply(WatchEvent::Applied(deployment("apps", "web", 1, 1))).await;
        cache.apply(WatchEvent::Applied(deployment("other", "db", 1, 1))).await;
        cache
            .apply(WatchEvent::Applied(service("apps", "web", "NodePort", 80, Some(30080))))
            .await;

        assert!(matches!(rx.recv().await.unwrap(), Event::ResourceApplied { .. }));

        assert_eq!(cache.deployments_in("apps").await.len(), 1);
        assert_eq!(cache.services_in("apps").await.len(), 1);
        assert!(cache.services_in("app").await.is_empty());
        assert_eq!(
            cache.namespace_phase("apps").await.unwrap().as_deref(),
            Some("Active")
        );
        assert_eq!(cache.namespace_phase("gone").await.unwrap(), None);

        let summary = cache.summary().await;
        assert_eq!(summary.deployments, 2);
        assert!(!summary.synced);
    }

    #[tokio::test]
    async fn test_synced_after_every_kind_restarts() {
        let (tx, _rx) = broadcast::channel(16);
        let cache = CacheManager::new(tx);

        cache.apply(WatchEvent::<Namespace>::Restarted(vec![])).await;
        cache.apply(WatchEvent::<Service>::Restarted(vec![])).await;
        cache.apply(WatchEvent::<Deployment>::Restarted(vec![])).await;
        assert!(!cache.is_synced().await);

        cache
            .apply(WatchEvent::Restarted(vec![node("n1", "10.0.0.1", true)]))
            .await;
        assert!(cache.is_synced().await);
        assert_eq!(cache.nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reader_prefers_synced_cache() {
        let (tx, _rx) = broadcast::channel(16);
        let cache = CacheManager::new(tx);
        // Nothing listens here, so every direct read fails
        let client = kube::Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap()))
            .unwrap();
        let reader = ClusterReader::new(Some(cache.clone()), K8sClient::from_client(client, "test"));

        assert!(reader.namespace_phase("apps").await.is_err());

        cache
            .apply(WatchEvent::Restarted(vec![namespace("apps", "Active")]))
            .await;
        cache.apply(WatchEvent::<Service>::Restarted(vec![])).await;
        cache.apply(WatchEvent::<Deployment>::Restarted(vec![])).await;
        cache.apply(WatchEvent::<Node>::Restarted(vec![])).await;

        assert_eq!(
            reader.namespace_phase("apps").await.unwrap().as_deref(),
            Some("Active")
        );
        assert!(reader.deployments("apps").await.unwrap().is_empty());
    }
}
