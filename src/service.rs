//! Application lifecycle: deploy, undeploy, inspect
//!
//! Requests only start the work. The cluster converges on its own and the
//! reconciler records the final status.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::k8s::manifest::{application_labels, deployment_names, namespace_for, render};
use crate::k8s::status::{service_urls, ClusterView};
use crate::k8s::{K8sClient, Reconciler, Target};
use crate::models::{
    Application, ApplicationStatus, ApplicationView, DeploymentView, ObjectKey, ServiceView,
};

#[derive(Clone)]
pub struct ApplicationService {
    db: Database,
    client: K8sClient,
    cluster: Arc<dyn ClusterView>,
    reconciler: Reconciler,
    namespace_prefix: String,
    detached: bool,
}

impl ApplicationService {
    pub fn new(
        db: Database,
        client: K8sClient,
        cluster: Arc<dyn ClusterView>,
        reconciler: Reconciler,
        namespace_prefix: &str,
    ) -> Self {
        Self {
            db,
            client,
            cluster,
            reconciler,
            namespace_prefix: namespace_prefix.to_string(),
            detached: true,
        }
    }

    /// When false, deploy and undeploy leave the status transitional and the
    /// caller is expected to `wait`
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    async fn load(&self, key: &ObjectKey) -> AppResult<Application> {
        self.db
            .get_application(key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("application {} not found", key)))
    }

    fn namespace_of(&self, app: &Application) -> String {
        app.namespace
            .clone()
            .unwrap_or_else(|| namespace_for(&self.namespace_prefix, &app.owner, &app.name))
    }

    /// Manifest the application would be deployed with
    pub async fn render(&self, key: &ObjectKey) -> AppResult<String> {
        let app = self.load(key).await?;
        self.render_for(&app, &self.namespace_of(&app)).await
    }

    async fn render_for(&self, app: &Application, namespace: &str) -> AppResult<String> {
        let template = self
            .db
            .get_template(&app.template_key())
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("template {} not found", app.template_key()))
            })?;

        render(
            &template.manifest,
            &app.parameters,
            namespace,
            &application_labels(&app.owner, &app.name),
        )
    }

    /// Render and apply the application, then watch it become Running
    #[instrument(skip(self), fields(app = %key))]
    pub async fn deploy(&self, key: &ObjectKey) -> AppResult<Application> {
        let mut app = self.load(key).await?;
        if app.status == ApplicationStatus::Terminating {
            return Err(AppError::Conflict(format!(
                "application {} is being undeployed",
                key
            )));
        }

        let namespace = self.namespace_of(&app);
        let manifest = self.render_for(&app, &namespace).await?;
        let expected = deployment_names(&manifest)?;

        // This deploy owns the status from here on
        self.reconciler.cancel(key).await;
        app.namespace = Some(namespace.clone());
        app.status = ApplicationStatus::Pending;
        app.message = None;
        self.db.update_application(&app).await?;
        self.reconciler
            .transition(key, ApplicationStatus::Pending, None)
            .await?;

        let labels = application_labels(&app.owner, &app.name);
        let applied = match self.client.ensure_namespace(&namespace, &labels).await {
            Ok(()) => self.client.apply_manifest(&manifest, &namespace).await,
            Err(e) => Err(e),
        };

        match applied {
            Ok(objects) => {
                info!(namespace = %namespace, objects = objects.len(), "Application manifest applied");
                metrics::counter!("appconsole_deployments_total", 1, "outcome" => "applied");
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(error = %message, "Failed to apply application");
                metrics::counter!("appconsole_deployments_total", 1, "outcome" => "failed");
                self.reconciler
                    .transition(key, ApplicationStatus::Failed, Some(&message))
                    .await?;
                return Err(AppError::from(e));
            }
        }

        self.track(key, namespace, Target::Running, expected).await;
        self.load(key).await
    }

    /// Delete the application namespace, then watch it disappear
    #[instrument(skip(self), fields(app = %key))]
    pub async fn undeploy(&self, key: &ObjectKey) -> AppResult<Application> {
        let app = self.load(key).await?;
        if app.status == ApplicationStatus::NotDeployed {
            info!("Application is not deployed");
            return Ok(app);
        }

        let namespace = self.namespace_of(&app);
        self.reconciler.cancel(key).await;
        self.reconciler
            .transition(key, ApplicationStatus::Terminating, None)
            .await?;

        match self.client.delete_namespace(&namespace).await {
            Ok(true) => {
                metrics::counter!("appconsole_undeployments_total", 1);
                self.track(key, namespace, Target::Removed, Vec::new()).await;
            }
            Ok(false) => {
                self.reconciler
                    .transition(key, ApplicationStatus::NotDeployed, None)
                    .await?;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(error = %message, "Failed to delete application namespace");
                self.reconciler
                    .transition(key, ApplicationStatus::Failed, Some(&message))
                    .await?;
                return Err(AppError::from(e));
            }
        }

        self.load(key).await
    }

    async fn track(&self, key: &ObjectKey, namespace: String, target: Target, expected: Vec<String>) {
        if self.detached {
            self.reconciler
                .watch(key.clone(), namespace, target, expected, self.cluster.clone())
                .await;
        }
    }

    /// Block until a transitional application settles
    pub async fn wait(&self, key: &ObjectKey) -> AppResult<ApplicationStatus> {
        let app = self.load(key).await?;
        let Some(target) = Target::for_status(app.status) else {
            return Ok(app.status);
        };
        let namespace = self.namespace_of(&app);
        let expected = match target {
            Target::Running => self.reconciler.expected_deployments(&app, &namespace).await,
            Target::Removed => Vec::new(),
        };
        self.reconciler
            .run(key, &namespace, target, &expected, self.cluster.as_ref())
            .await
    }

    /// The application together with what the cluster reports for it
    pub async fn view(&self, key: &ObjectKey) -> AppResult<ApplicationView> {
        let application = self.load(key).await?;
        let Some(namespace) = application.namespace.clone() else {
            return Ok(ApplicationView {
                application,
                services: vec![],
                deployments: vec![],
                urls: vec![],
            });
        };

        let services: Vec<ServiceView> = self
            .cluster
            .services(&namespace)
            .await?
            .iter()
            .map(ServiceView::from)
            .collect();
        let deployments = self
            .cluster
            .deployments(&namespace)
            .await?
            .iter()
            .map(DeploymentView::from)
            .collect();
        let nodes = self.cluster.nodes().await?;
        let urls = service_urls(&services, &nodes);

        Ok(ApplicationView {
            application,
            services,
            deployments,
            urls,
        })
    }
}
