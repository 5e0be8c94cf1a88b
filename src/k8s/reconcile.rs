//! Application deployment reconciliation
//!
//! After a deploy or undeploy request the cluster converges on its own; the
//! reconciler polls it on a fixed interval and moves the application's status
//! to its terminal value, or to Failed once the timeout elapses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::manifest::{application_labels, deployment_names, render};
use super::status::ClusterView;
use crate::api::Event;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{Application, ApplicationStatus, DeploymentView, ObjectKey};

/// What the application is converging towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Target {
    Running,
    Removed,
}

impl Target {
    /// Target implied by a transitional status
    pub fn for_status(status: ApplicationStatus) -> Option<Self> {
        match status {
            ApplicationStatus::Pending => Some(Target::Running),
            ApplicationStatus::Terminating => Some(Target::Removed),
            _ => None,
        }
    }

    /// Status the application holds while converging on this target
    pub fn transitional_status(self) -> ApplicationStatus {
        match self {
            Target::Running => ApplicationStatus::Pending,
            Target::Removed => ApplicationStatus::Terminating,
        }
    }
}

/// What the cluster currently shows for an application namespace
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub namespace_phase: Option<String>,
    pub deployments: Vec<DeploymentView>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Waiting,
    Done(ApplicationStatus, Option<String>),
}

/// Decide whether an observation settles the application.
///
/// `expected` names the Deployments of the applied manifest. Running needs
/// every one of them observed and rolled out, so a view that lags behind the
/// apply keeps the application Pending.
pub fn evaluate(target: Target, expected: &[String], observation: &Observation) -> Verdict {
    match target {
        Target::Removed => match observation.namespace_phase {
            None => Verdict::Done(ApplicationStatus::NotDeployed, None),
            Some(_) => Verdict::Waiting,
        },
        Target::Running => {
            match observation.namespace_phase.as_deref() {
                Some("Active") => {}
                _ => return Verdict::Waiting,
            }

            if let Some(failed) = observation.deployments.iter().find(|d| d.failure.is_some()) {
                let reason = failed.failure.clone().unwrap_or_default();
                return Verdict::Done(
                    ApplicationStatus::Failed,
                    Some(format!("deployment {}: {}", failed.name, reason)),
                );
            }

            let all_observed = expected
                .iter()
                .all(|name| observation.deployments.iter().any(|d| &d.name == name));
            if all_observed && observation.deployments.iter().all(DeploymentView::is_ready) {
                Verdict::Done(ApplicationStatus::Running, None)
            } else {
                Verdict::Waiting
            }
        }
    }
}

/// Read the current observation for a namespace
pub async fn observe(view: &dyn ClusterView, namespace: &str) -> anyhow::Result<Observation> {
    let namespace_phase = view.namespace_phase(namespace).await?;
    let deployments = match namespace_phase {
        Some(_) => view
            .deployments(namespace)
            .await?
            .iter()
            .map(DeploymentView::from)
            .collect(),
        None => Vec::new(),
    };

    Ok(Observation {
        namespace_phase,
        deployments,
    })
}

/// Drives applications out of transitional states
#[derive(Clone)]
pub struct Reconciler {
    db: Database,
    event_tx: broadcast::Sender<Event>,
    interval: Duration,
    timeout: Duration,
    watches: Arc<Mutex<HashMap<ObjectKey, (u64, JoinHandle<()>)>>>,
    next_watch: Arc<AtomicU64>,
}

impl Reconciler {
    pub fn new(
        db: Database,
        event_tx: broadcast::Sender<Event>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            event_tx,
            interval,
            timeout,
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_watch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start watching an application in the background, replacing any
    /// earlier watch of the same application
    pub async fn watch(
        &self,
        key: ObjectKey,
        namespace: String,
        target: Target,
        expected: Vec<String>,
        view: Arc<dyn ClusterView>,
    ) {
        let reconciler = self.clone();
        let task_key = key.clone();
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);

        let mut watches = self.watches.lock().await;
        if let Some((_, previous)) = watches.remove(&key) {
            debug!(app = %key, "Superseding previous watch");
            previous.abort();
        }

        let handle = tokio::spawn(async move {
            if let Err(e) = reconciler
                .run(&task_key, &namespace, target, &expected, view.as_ref())
                .await
            {
                warn!(app = %task_key, error = %e, "Reconciliation aborted");
            }

            // A newer watch may own the slot by now
            let mut watches = reconciler.watches.lock().await;
            if watches.get(&task_key).map(|(current, _)| *current) == Some(id) {
                watches.remove(&task_key);
            }
        });
        watches.insert(key, (id, handle));
    }

    /// Stop the watch of an application; returns false when none was running
    pub async fn cancel(&self, key: &ObjectKey) -> bool {
        match self.watches.lock().await.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                debug!(app = %key, "Cancelled watch");
                true
            }
            None => false,
        }
    }

    /// Poll until the application settles or the timeout elapses; returns the
    /// status the application ends up with
    #[instrument(skip(self, expected, view), fields(app = %key))]
    pub async fn run(
        &self,
        key: &ObjectKey,
        namespace: &str,
        target: Target,
        expected: &[String],
        view: &dyn ClusterView,
    ) -> AppResult<ApplicationStatus> {
        info!(namespace, target = %target, expected = ?expected, "Watching application");

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match observe(view, namespace).await {
                Ok(observation) => {
                    if let Verdict::Done(status, message) = evaluate(target, expected, &observation) {
                        return self.settle(key, target, status, message.as_deref()).await;
                    }
                    debug!(
                        phase = ?observation.namespace_phase,
                        deployments = observation.deployments.len(),
                        "Application not settled yet"
                    );
                }
                Err(e) => {
                    // Transient API errors do not end the watch
                    warn!(error = %e, "Failed to observe application");
                }
            }

            if started.elapsed() >= self.timeout {
                let message = format!("timed out after {:?} waiting for {}", self.timeout, target);
                return self
                    .settle(key, target, ApplicationStatus::Failed, Some(&message))
                    .await;
            }
        }
    }

    /// Record a verdict, unless the application already left the transitional
    /// status this watch was started for
    async fn settle(
        &self,
        key: &ObjectKey,
        target: Target,
        status: ApplicationStatus,
        message: Option<&str>,
    ) -> AppResult<ApplicationStatus> {
        let from = target.transitional_status();
        if self
            .db
            .update_application_status_from(key, from, status, message)
            .await?
        {
            self.announce(key, status, message);
            return Ok(status);
        }

        let current = self
            .db
            .get_application(key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("application {}", key)))?;
        info!(
            app = %key,
            verdict = %status,
            current = %current.status,
            "Application changed while watched, verdict dropped"
        );
        Ok(current.status)
    }

    /// Persist and broadcast a status change
    pub async fn transition(
        &self,
        key: &ObjectKey,
        status: ApplicationStatus,
        message: Option<&str>,
    ) -> AppResult<()> {
        self.db
            .update_application_status(key, status, message)
            .await?;
        self.announce(key, status, message);
        Ok(())
    }

    fn announce(&self, key: &ObjectKey, status: ApplicationStatus, message: Option<&str>) {
        info!(app = %key, status = %status, message = ?message, "Application status changed");
        metrics::counter!("appconsole_app_transitions_total", 1, "status" => status.to_string());

        let _ = self.event_tx.send(Event::AppStatusChanged {
            app_id: key.to_string(),
            status: status.to_string(),
            message: message.map(str::to_string),
        });
    }

    /// Deployments the application's manifest declares. Empty when the
    /// manifest can no longer be rendered, which leaves only the namespace and
    /// the deployments present to judge by.
    pub async fn expected_deployments(&self, app: &Application, namespace: &str) -> Vec<String> {
        match self.render_deployments(app, namespace).await {
            Ok(names) => names,
            Err(e) => {
                warn!(app = %app.key(), error = %e, "Cannot determine expected deployments");
                Vec::new()
            }
        }
    }

    async fn render_deployments(&self, app: &Application, namespace: &str) -> AppResult<Vec<String>> {
        let template = self
            .db
            .get_template(&app.template_key())
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("template {} not found", app.template_key()))
            })?;
        let manifest = render(
            &template.manifest,
            &app.parameters,
            namespace,
            &application_labels(&app.owner, &app.name),
        )?;
        deployment_names(&manifest)
    }

    /// Re-attach watches to applications left transitional by a restart
    pub async fn resume_pending(&self, view: Arc<dyn ClusterView>) -> AppResult<usize> {
        let apps = self
            .db
            .list_applications_in_status(&[
                ApplicationStatus::Pending,
                ApplicationStatus::Terminating,
            ])
            .await?;

        let mut resumed = 0;
        for app in apps {
            match resume_target(&app) {
                Ok((namespace, target)) => {
                    let expected = match target {
                        Target::Running => self.expected_deployments(&app, &namespace).await,
                        Target::Removed => Vec::new(),
                    };
                    self.watch(app.key(), namespace, target, expected, view.clone())
                        .await;
                    resumed += 1;
                }
                Err(e) => {
                    warn!(app = %app.key(), error = %e, "Cannot resume application");
                    self.transition(&app.key(), ApplicationStatus::Failed, Some(&e.to_string()))
                        .await?;
                }
            }
        }

        if resumed > 0 {
            info!(resumed, "Resumed application watches");
        }
        Ok(resumed)
    }
}

fn resume_target(app: &Application) -> AppResult<(String, Target)> {
    let target = Target::for_status(app.status)
        .ok_or_else(|| AppError::internal("application is not transitional"))?;
    let namespace = app
        .namespace
        .clone()
        .ok_or_else(|| AppError::internal("transitional application without namespace"))?;
    Ok((namespace, target))
}
