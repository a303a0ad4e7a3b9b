use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chartstore_backend::{
    api::AppState,
    auth::{PermitAllPolicy, PolicyApi},
    bus::{Bus, BULK_DEPLOY_TOPIC},
    cd::{CdClient, ControllerApi},
    config::Config,
    create_router,
    db::{AppLocks, Database},
    git::{GitCliClient, GitOpsApi},
    helm::{HelmClient, ReleaseApi},
    k8s::{K8sClient, RepositoryCreds},
    pipeline::DeploymentPipeline,
    service::{
        BulkService, ChartRepoService, InstallService, MigrationService, StatusReconciler,
    },
};

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

    tracing::info!("Starting ChartStore Backend");

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database_url).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let bus = Bus::new();
    let locks = AppLocks::new();
    let release: Arc<dyn ReleaseApi> = Arc::new(HelmClient::new());
    let policy: Arc<dyn PolicyApi> = Arc::new(PermitAllPolicy);

    // GitOps integration is optional; without it the process runs in
    // direct-release-only mode and no controller client exists.
    let mut controller: Option<Arc<dyn ControllerApi>> = None;
    let mut git: Option<Arc<dyn GitOpsApi>> = None;
    let mut k8s: Option<K8sClient> = None;
    let mut creds: Option<RepositoryCreds> = None;
    if config.gitops_enabled {
        let cd = CdClient::connect(&config.cd_endpoint(), config.cd_auth_token.as_deref())
            .map_err(|e| anyhow::anyhow!("failed to build CD controller client: {e}"))?;
        controller = Some(Arc::new(cd));
        git = Some(Arc::new(GitCliClient::new(config.git_workdir.clone())));
        match K8sClient::new().await {
            Ok(client) => {
                creds = Some(RepositoryCreds::new(
                    client.clone(),
                    config.cd_namespace.clone(),
                    config.cd_config_map_name.clone(),
                ));
                k8s = Some(client);
            }
            Err(e) => {
                tracing::warn!("Kubernetes client unavailable: {e}. CRD annotation and credential projection disabled.");
            }
        }
        tracing::info!("GitOps integration enabled");
    } else {
        tracing::info!("Running in direct-release-only mode");
    }

    // Deploy worker pool
    let pipeline = Arc::new(DeploymentPipeline::new(
        db.clone(),
        locks.clone(),
        controller.clone(),
        release.clone(),
        git.clone(),
        config.argo_auto_sync_enabled,
    ));
    pipeline
        .clone()
        .spawn_workers(bus.subscribe(BULK_DEPLOY_TOPIC), config.bulk_worker_pool_size);
    tracing::info!(pool = config.bulk_worker_pool_size, "Deploy workers started");

    // Status reconciler
    let reconciler = Arc::new(StatusReconciler::new(
        db.clone(),
        pipeline.clone(),
        config.trigger_stale_minutes,
        config.trigger_abandon_hours,
        config.pending_since_seconds,
        config.degradation_minutes,
    ));
    reconciler.spawn(config.reconcile_interval_seconds);

    // Services and router
    let install = Arc::new(InstallService::new(
        db.clone(),
        bus.clone(),
        locks.clone(),
        policy.clone(),
        controller.clone(),
        release.clone(),
        config.gitops_enabled,
        config.gitops_repo_base_url.clone(),
    ));
    let bulk = Arc::new(BulkService::new(
        db.clone(),
        bus.clone(),
        policy.clone(),
        config.gitops_enabled,
        config.gitops_repo_base_url.clone(),
    ));
    let migration = Arc::new(MigrationService::new(
        db.clone(),
        bus.clone(),
        controller.clone(),
        release.clone(),
        k8s.clone(),
        config.gitops_enabled,
        config.gitops_repo_base_url.clone(),
    ));
    let chart_repos = Arc::new(ChartRepoService::new(db.clone(), creds));

    let state = AppState {
        install,
        bulk,
        migration,
        chart_repos,
    };
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
