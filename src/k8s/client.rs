//! Kubernetes client wrapper for AppConsole

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{self, ApiCapabilities, ApiResource, Scope},
    Client,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, instrument, warn};

use super::manifest::{is_owned_by, split_documents};
use super::status::ClusterView;
use crate::config::Config;
use crate::error::AppError;

/// Discovery results keyed by (apiVersion, kind), reused within one manifest
type DiscoveryCache = HashMap<(String, String), (ApiResource, ApiCapabilities)>;

/// What an idempotent apply did to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Created,
    Updated,
}

/// One object of an applied manifest
#[derive(Debug, Clone, Serialize)]
pub struct AppliedObject {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub outcome: ApplyOutcome,
}

impl fmt::Display for AppliedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "configured",
        };
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} ({}) {}", self.kind, self.name, ns, outcome),
            None => write!(f, "{}/{} {}", self.kind, self.name, outcome),
        }
    }
}

/// Wrapper around kube::Client with the operations the console needs
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
    field_manager: String,
}

impl K8sClient {
    /// Create a client from an explicit kubeconfig or the inferred environment
    #[instrument(skip_all)]
    pub async fn new(config: &Config) -> Result<Self> {
        let kube_config = match &config.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path))?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?
            }
            None => kube::Config::infer().await?,
        };
        let client = Client::try_from(kube_config)?;

        debug!(default_namespace = %client.default_namespace(), "Kubernetes client created");

        Ok(Self::from_client(client, &config.field_manager))
    }

    pub fn from_client(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    /// Get the inner kube Client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Check the API server answers; returns its version
    pub async fn health_check(&self) -> Result<String> {
        let version = self.client.apiserver_version().await?;
        info!(version = %version.git_version, "Kubernetes cluster is healthy");
        Ok(version.git_version)
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    /// Create a namespace unless it already exists. An existing namespace must
    /// carry `labels`, otherwise it belongs to someone else and this fails with
    /// `AppError::Conflict`.
    #[instrument(skip(self, labels))]
    pub async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        match self.namespaces().create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                let existing = self.namespaces().get(name).await?;
                if !is_owned_by(existing.metadata.labels.as_ref(), labels) {
                    warn!(namespace = %name, "Namespace exists with foreign labels");
                    return Err(AppError::Conflict(format!(
                        "namespace {} belongs to another application",
                        name
                    ))
                    .into());
                }
                info!(namespace = %name, "Namespace already exists");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Delete a namespace; returns false when there was nothing to delete
    #[instrument(skip(self))]
    pub async fn delete_namespace(&self, name: &str) -> Result<bool> {
        match self.namespaces().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %name, "Namespace deletion requested");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!(namespace = %name, "Namespace already gone");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply every document of a manifest: create when absent, otherwise
    /// server-side apply under our field manager
    #[instrument(skip(self, yaml))]
    pub async fn apply_manifest(&self, yaml: &str, default_namespace: &str) -> Result<Vec<AppliedObject>> {
        let mut resolved: DiscoveryCache = HashMap::new();
        let mut applied = Vec::new();

        for document in split_documents(yaml)? {
            let mut obj: DynamicObject =
                serde_yaml::from_value(document).context("Invalid manifest document")?;
            let (api, kind) = self.dynamic_api(&mut obj, default_namespace, &mut resolved).await?;
            let name = obj
                .metadata
                .name
                .clone()
                .ok_or_else(|| anyhow!("{} without metadata.name", kind))?;

            let outcome = match api.get_opt(&name).await? {
                None => {
                    let params = PostParams {
                        field_manager: Some(self.field_manager.clone()),
                        ..Default::default()
                    };
                    api.create(&params, &obj).await?;
                    ApplyOutcome::Created
                }
                Some(_) => {
                    let params = PatchParams::apply(&self.field_manager).force();
                    api.patch(&name, &params, &Patch::Apply(&obj)).await?;
                    ApplyOutcome::Updated
                }
            };

            let object = AppliedObject {
                kind,
                name,
                namespace: obj.metadata.namespace.clone(),
                outcome,
            };
            info!(object = %object, "Applied manifest object");
            applied.push(object);
        }

        Ok(applied)
    }

    /// Delete every object of a manifest, ignoring the ones already gone
    #[instrument(skip(self, yaml))]
    pub async fn delete_manifest(&self, yaml: &str, default_namespace: &str) -> Result<usize> {
        let mut resolved = HashMap::new();
        let mut deleted = 0;

        for document in split_documents(yaml)? {
            let mut obj: DynamicObject =
                serde_yaml::from_value(document).context("Invalid manifest document")?;
            let (api, kind) = self.dynamic_api(&mut obj, default_namespace, &mut resolved).await?;
            let Some(name) = obj.metadata.name.clone() else {
                continue;
            };

            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    info!(kind = %kind, name = %name, "Deleted manifest object");
                    deleted += 1;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(kind = %kind, name = %name, "Manifest object already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(deleted)
    }

    /// Resolve the API of a dynamic object through discovery, defaulting its
    /// namespace when the kind is namespaced
    async fn dynamic_api(
        &self,
        obj: &mut DynamicObject,
        default_namespace: &str,
        resolved: &mut DiscoveryCache,
    ) -> Result<(Api<DynamicObject>, String)> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| anyhow!("manifest document without apiVersion/kind"))?;
        let gvk = parse_gvk(&types.api_version, &types.kind)?;
        let key = (types.api_version.clone(), types.kind.clone());

        if !resolved.contains_key(&key) {
            let found = discovery::pinned_kind(&self.client, &gvk)
                .await
                .with_context(|| format!("Unknown resource {}/{}", key.0, key.1))?;
            resolved.insert(key.clone(), found);
        }
        let (ar, caps) = &resolved[&key];

        let api = match caps.scope {
            Scope::Namespaced => {
                let ns = obj
                    .metadata
                    .namespace
                    .get_or_insert_with(|| default_namespace.to_string())
                    .clone();
                Api::namespaced_with(self.client.clone(), &ns, ar)
            }
            Scope::Cluster => {
                obj.metadata.namespace = None;
                Api::all_with(self.client.clone(), ar)
            }
        };

        Ok((api, gvk.kind))
    }

    pub async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl ClusterView for K8sClient {
    async fn namespace_phase(&self, namespace: &str) -> Result<Option<String>> {
        let ns = self.namespaces().get_opt(namespace).await?;
        Ok(ns.map(|ns| {
            ns.status
                .and_then(|s| s.phase)
                .unwrap_or_else(|| "Active".to_string())
        }))
    }

    async fn deployments(&self, namespace: &str) -> Result<Vec<Deployment>> {
        self.list_deployments(namespace).await
    }

    async fn services(&self, namespace: &str) -> Result<Vec<Service>> {
        self.list_services(namespace).await
    }

    async fn nodes(&self) -> Result<Vec<Node>> {
        self.list_nodes().await
    }
}

/// Split `group/version` (or core `version`) and pair it with a kind
pub fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind> {
    if api_version.is_empty() || kind.is_empty() {
        return Err(anyhow!("manifest document without apiVersion/kind"));
    }
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) if !group.is_empty() && !version.is_empty() => (group, version),
        Some(_) => return Err(anyhow!("invalid apiVersion '{}'", api_version)),
        None => ("", api_version),
    };
    Ok(GroupVersionKind::gvk(group, version, kind))
}


#[cfg(test)]
mod tests {
    use super::mock::{namespace, scripted_client, status};
    use super::*;
    use crate::k8s::manifest::application_labels;
    use http::Method;
    use serde_json::json;

    #[test]
    fn test_parse_gvk_core_group() {
        let gvk = parse_gvk("v1", "Service").unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Service");
    }

    #[test]
    fn test_parse_gvk_named_group() {
        let gvk = parse_gvk("apps/v1", "Deployment").unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn test_parse_gvk_rejects_garbage() {
        assert!(parse_gvk("apps/", "Deployment").is_err());
        assert!(parse_gvk("", "Deployment").is_err());
        assert!(parse_gvk("v1", "").is_err());
    }

    #[test]
    fn test_applied_object_display() {
        let object = AppliedObject {
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: Some("apps".to_string()),
            outcome: ApplyOutcome::Updated,
        };
        assert_eq!(object.to_string(), "Deployment/web (apps) configured");
    }

    #[tokio::test]
    async fn test_ensure_namespace_adopts_own_namespace() {
        let labels = application_labels("admin", "blog");
        let (client, server) = scripted_client(vec![
            (Method::POST, "/namespaces", 409, status(409, "AlreadyExists")),
            (Method::GET, "/namespaces/apps", 200, namespace("apps", json!(labels))),
        ]);

        client.ensure_namespace("apps", &labels).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_namespace_rejects_foreign_namespace() {
        let (client, server) = scripted_client(vec![
            (Method::POST, "/namespaces", 409, status(409, "AlreadyExists")),
            (
                Method::GET,
                "/namespaces/apps",
                200,
                namespace("apps", json!(application_labels("other", "shop"))),
            ),
        ]);

        let err = client
            .ensure_namespace("apps", &application_labels("admin", "blog"))
            .await
            .unwrap_err();
        assert!(matches!(AppError::from(err), AppError::Conflict(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_namespace_reports_absence() {
        let (client, server) = scripted_client(vec![
            (Method::DELETE, "/namespaces/apps", 200, namespace("apps", json!({}))),
            (Method::DELETE, "/namespaces/apps", 404, status(404, "NotFound")),
        ]);

        assert!(client.delete_namespace("apps").await.unwrap());
        assert!(!client.delete_namespace("apps").await.unwrap());
        server.await.unwrap();
    }
}
