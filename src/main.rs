use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use appconsole_backend::{
    api::AppState,
    config::Config,
    create_router,
    db::Database,
    k8s::{ClusterReader, ClusterView, K8sClient, Reconciler},
    models::{Application, ObjectKey, Template},
    service::ApplicationService,
};

#[derive(Parser)]
#[command(name = "appconsole")]
#[command(about = "Deploy templated applications into Kubernetes namespaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cache, the reconciler and the ops HTTP server (default)
    Serve,
    /// Store a template manifest
    AddTemplate {
        /// owner/name
        key: String,
        /// Multi-document YAML manifest
        #[arg(short, long)]
        file: String,
    },
    /// Store an application based on a template of the same owner
    AddApp {
        /// owner/name
        key: String,
        #[arg(short, long)]
        template: String,
        /// YAML patch documents merged over the template
        #[arg(short, long)]
        parameters: Option<String>,
    },
    /// Deploy an application and wait for it to settle
    Deploy { key: String },
    /// Remove an application's namespace and wait for it to disappear
    Undeploy { key: String },
    /// Show an application with its services, deployments and URLs
    Status { key: String },
    /// Print the manifest an application would be deployed with
    Render { key: String },
    /// Apply a raw manifest file
    Apply {
        #[arg(short, long)]
        file: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
    /// Delete the objects of a raw manifest file
    Delete {
        #[arg(short, long)]
        file: String,
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::AddTemplate { key, file } => {
            let key = parse_key(&key)?;
            let manifest = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file))?;
            appconsole_backend::k8s::manifest::split_documents(&manifest)?;

            let db = open_database(&config).await?;
            db.add_template(&Template::new(&key.owner, &key.name, &manifest))
                .await?;
            println!("template {} added", key);
            Ok(())
        }
        Commands::AddApp {
            key,
            template,
            parameters,
        } => {
            let key = parse_key(&key)?;
            let mut app = Application::new(&key.owner, &key.name, &template);
            if let Some(path) = parameters {
                app.parameters = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path))?;
            }

            let db = open_database(&config).await?;
            db.add_application(&app).await?;
            println!("application {} added", key);
            Ok(())
        }
        Commands::Deploy { key } => {
            let key = parse_key(&key)?;
            let service = one_shot_service(&config).await?;
            let app = service.deploy(&key).await?;
            println!("{}: {}", app.id(), app.status);
            let status = service.wait(&key).await?;
            println!("{}: {}", app.id(), status);
            Ok(())
        }
        Commands::Undeploy { key } => {
            let key = parse_key(&key)?;
            let service = one_shot_service(&config).await?;
            let app = service.undeploy(&key).await?;
            println!("{}: {}", app.id(), app.status);
            let status = service.wait(&key).await?;
            println!("{}: {}", app.id(), status);
            Ok(())
        }
        Commands::Status { key } => {
            let key = parse_key(&key)?;
            let service = one_shot_service(&config).await?;
            let view = service.view(&key).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Render { key } => {
            let key = parse_key(&key)?;
            let service = one_shot_service(&config).await?;
            print!("{}", service.render(&key).await?);
            Ok(())
        }
        Commands::Apply { file, namespace } => {
            let yaml = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file))?;
            let k8s = K8sClient::new(&config).await?;
            for object in k8s.apply_manifest(&yaml, &namespace).await? {
                println!("{}", object);
            }
            Ok(())
        }
        Commands::Delete { file, namespace } => {
            let yaml = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file))?;
            let k8s = K8sClient::new(&config).await?;
            let deleted = k8s.delete_manifest(&yaml, &namespace).await?;
            println!("{} objects deleted", deleted);
            Ok(())
        }
    }
}

fn parse_key(key: &str) -> Result<ObjectKey> {
    key.parse::<ObjectKey>().map_err(|e| anyhow::anyhow!(e))
}

async fn open_database(config: &Config) -> Result<Database> {
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;
    Ok(db)
}

/// Service for CLI commands: direct API reads, watches run in the foreground
async fn one_shot_service(config: &Config) -> Result<ApplicationService> {
    let db = open_database(config).await?;
    let k8s = K8sClient::new(config).await?;
    k8s.health_check().await?;

    let (event_tx, _) = tokio::sync::broadcast::channel(16);
    let reconciler = Reconciler::new(
        db.clone(),
        event_tx,
        config.reconcile_interval(),
        config.reconcile_timeout(),
    );
    let cluster: Arc<dyn ClusterView> = Arc::new(k8s.clone());

    Ok(
        ApplicationService::new(db, k8s, cluster, reconciler, &config.namespace_prefix)
            .detached(false),
    )
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting AppConsole Backend");

    let recorder = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let db = open_database(&config).await?;
    tracing::info!("Database initialized");

    let state = AppState::new(db, config.clone()).with_metrics(recorder);

    // Spawn K8s Connection Manager (Automatic Reconnection)
    let mgr_state = state.clone();
    tokio::spawn(async move {
        let mut started = false;
        tracing::info!("K8s Connection Manager started");

        loop {
            let current = mgr_state.k8s.read().await.clone();

            match current {
                None => match K8sClient::new(&mgr_state.config).await {
                    Ok(k8s) => match k8s.health_check().await {
                        Ok(_) => {
                            tracing::info!("Connected to Kubernetes cluster");
                            mgr_state.set_k8s(k8s).await;
                        }
                        Err(e) => {
                            tracing::warn!("K8s client created but unhealthy: {:#}", e);
                        }
                    },
                    Err(e) => {
                        tracing::debug!("K8s connection attempt failed: {:#}", e);
                    }
                },
                Some(k8s) => {
                    if let Err(e) = k8s.health_check().await {
                        tracing::error!("Lost K8s connection: {:#}. Reconnecting...", e);
                        mgr_state.clear_k8s().await;
                    }
                }
            }

            // Cache and watches start once, on the first connection
            if !started {
                if let Some(k8s) = mgr_state.k8s.read().await.clone() {
                    if let Err(e) = start_lifecycle(&mgr_state, k8s).await {
                        tracing::error!("Failed to resume application watches: {}", e);
                    }
                    started = true;
                }
            }

            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn start_lifecycle(state: &AppState, k8s: K8sClient) -> Result<()> {
    let cache = if state.config.cache_enabled {
        state.cache.start(k8s.inner().clone()).await;
        Some(state.cache.clone())
    } else {
        None
    };

    let reconciler = Reconciler::new(
        state.db.clone(),
        state.event_tx.clone(),
        state.config.reconcile_interval(),
        state.config.reconcile_timeout(),
    );
    let cluster: Arc<dyn ClusterView> = Arc::new(ClusterReader::new(cache, k8s));
    let resumed = reconciler.resume_pending(cluster).await?;
    tracing::info!(resumed, "Application lifecycle started");
    Ok(())
}
