use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: Option<String>,

    /// Prefix of every namespace created for an application
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,

    /// Field manager used for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_reconcile_timeout_secs")]
    pub reconcile_timeout_secs: u64,

    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite://appconsole.db".to_string()
}

fn default_kubeconfig() -> Option<String> {
    None
}

fn default_namespace_prefix() -> String {
    "appconsole".to_string()
}

fn default_field_manager() -> String {
    "appconsole".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    2
}

fn default_reconcile_timeout_secs() -> u64 {
    300
}

fn default_cache_enabled() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_environment(config::Environment::default())
    }

    /// Unset variables take their defaults; a variable that does not parse is
    /// an error rather than a silent fallback
    fn from_environment(environment: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment.try_parsing(true))
            .build()?;

        config
            .try_deserialize()
            .context("Invalid configuration in environment")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: default_database_url(),
            kubeconfig: default_kubeconfig(),
            namespace_prefix: default_namespace_prefix(),
            field_manager: default_field_manager(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_timeout_secs: default_reconcile_timeout_secs(),
            cache_enabled: default_cache_enabled(),
        }
    }
}
