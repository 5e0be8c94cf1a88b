use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::ObjectKey;

/// Lifecycle state of an application in the cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
pub enum ApplicationStatus {
    #[serde(rename = "Not Deployed")]
    #[strum(serialize = "Not Deployed")]
    NotDeployed,
    Pending,
    Running,
    Failed,
    Terminating,
}

impl ApplicationStatus {
    /// States the reconciler is still driving towards a terminal state
    pub fn is_transitional(&self) -> bool {
        matches!(self, ApplicationStatus::Pending | ApplicationStatus::Terminating)
    }
}

/// An application instantiated from a template into its own namespace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub owner: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub display_name: String,
    pub description: String,
    /// Name of the template (same owner) the manifest comes from
    pub template: String,
    /// YAML patch documents merged over the template manifest
    pub parameters: String,
    /// Namespace the application was last deployed to
    pub namespace: Option<String>,
    pub status: ApplicationStatus,
    pub message: Option<String>,
}

impl Application {
    pub fn new(owner: &str, name: &str, template: &str) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            created_time: now,
            updated_time: now,
            display_name: name.to_string(),
            description: String::new(),
            template: template.to_string(),
            parameters: String::new(),
            namespace: None,
            status: ApplicationStatus::NotDeployed,
            message: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.owner, &self.name)
    }

    pub fn id(&self) -> String {
        self.key().to_string()
    }

    /// Key of the template this application is rendered from
    pub fn template_key(&self) -> ObjectKey {
        ObjectKey::new(&self.owner, &self.template)
    }
}

/// Port exposed by a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortView {
    pub name: Option<String>,
    pub port: i32,
    pub node_port: Option<i32>,
    pub protocol: String,
}

/// Service as seen by the console
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub name: String,
    pub service_type: String,
    pub cluster_ip: Option<String>,
    pub ports: Vec<ServicePortView>,
    pub ingress: Vec<String>,
}

/// Deployment readiness as seen by the console
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentView {
    pub name: String,
    pub desired: i32,
    pub ready: i32,
    pub available: i32,
    /// Replicas running the latest pod template
    pub updated: i32,
    /// The controller has seen the latest spec (`observedGeneration >= generation`)
    pub observed: bool,
    /// Set when the deployment reports a failed rollout
    pub failure: Option<String>,
}

impl DeploymentView {
    /// Rolled out: the current spec was observed and enough updated pods are ready
    pub fn is_ready(&self) -> bool {
        self.observed && self.updated >= self.desired && self.ready >= self.desired
    }
}

/// Runtime view of an application: the record plus what the cluster reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationView {
    #[serde(flatten)]
    pub application: Application,
    pub services: Vec<ServiceView>,
    pub deployments: Vec<DeploymentView>,
    pub urls: Vec<String>,
}
