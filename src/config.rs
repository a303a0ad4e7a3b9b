use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// CD controller endpoint.
    #[serde(default = "default_cd_host")]
    pub cd_host: String,

    #[serde(default = "default_cd_port")]
    pub cd_port: u16,

    /// Namespace the CD controller runs in; its ConfigMap and repository
    /// Secrets live here.
    #[serde(default = "default_cd_namespace")]
    pub cd_namespace: String,

    #[serde(default = "default_cd_config_map_name")]
    pub cd_config_map_name: String,

    /// Bearer token for the controller service account.
    #[serde(default)]
    pub cd_auth_token: Option<String>,

    /// Whether the controller applies changes automatically on Git change.
    /// When false the pipeline issues an explicit sync per deployment.
    #[serde(default = "default_true")]
    pub argo_auto_sync_enabled: bool,

    /// GitOps integration toggle. When false the process runs in
    /// direct-release-only mode and the controller client is never built.
    #[serde(default)]
    pub gitops_enabled: bool,

    /// Base URL under which per-app GitOps repositories are created when the
    /// installation does not bring a custom repository.
    #[serde(default)]
    pub gitops_repo_base_url: Option<String>,

    #[serde(default = "default_git_workdir")]
    pub git_workdir: String,

    #[serde(default = "default_bulk_worker_pool_size")]
    pub bulk_worker_pool_size: usize,

    /// Seconds between reconciler passes.
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,

    /// A non-terminal history older than this is considered stuck.
    #[serde(default = "default_trigger_stale_minutes")]
    pub trigger_stale_minutes: i64,

    /// Histories untouched for longer than this are abandoned, not swept.
    #[serde(default = "default_trigger_abandon_hours")]
    pub trigger_abandon_hours: i64,

    /// Age of the last timeline entry before the second sweep picks it up.
    #[serde(default = "default_pending_since_seconds")]
    pub pending_since_seconds: i64,

    /// How long a deployment may sit past apply before it is declared
    /// degraded.
    #[serde(default = "default_degradation_minutes")]
    pub degradation_minutes: i64,
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite://chartstore.db".to_string()
}

fn default_cd_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cd_port() -> u16 {
    8000
}

fn default_cd_namespace() -> String {
    "cdcontroller".to_string()
}

fn default_cd_config_map_name() -> String {
    "argocd-cm".to_string()
}

fn default_true() -> bool {
    true
}

fn default_git_workdir() -> String {
    "/tmp/chartstore-gitops".to_string()
}

fn default_bulk_worker_pool_size() -> usize {
    4
}

fn default_reconcile_interval_seconds() -> u64 {
    120
}

fn default_trigger_stale_minutes() -> i64 {
    5
}

fn default_trigger_abandon_hours() -> i64 {
    12
}

fn default_pending_since_seconds() -> i64 {
    300
}

fn default_degradation_minutes() -> i64 {
    10
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let settings: Config = config
            .try_deserialize()
            .unwrap_or_else(|_| Config::default());

        Ok(settings)
    }

    pub fn cd_endpoint(&self) -> String {
        format!("http://{}:{}", self.cd_host, self.cd_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: default_database_url(),
            cd_host: default_cd_host(),
            cd_port: default_cd_port(),
            cd_namespace: default_cd_namespace(),
            cd_config_map_name: default_cd_config_map_name(),
            cd_auth_token: None,
            argo_auto_sync_enabled: true,
            gitops_enabled: false,
            gitops_repo_base_url: None,
            git_workdir: default_git_workdir(),
            bulk_worker_pool_size: default_bulk_worker_pool_size(),
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
            trigger_stale_minutes: default_trigger_stale_minutes(),
            trigger_abandon_hours: default_trigger_abandon_hours(),
            pending_since_seconds: default_pending_since_seconds(),
            degradation_minutes: default_degradation_minutes(),
        }
    }
}
