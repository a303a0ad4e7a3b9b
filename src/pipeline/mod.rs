//! Per-deployment state machine. One bus message is one attempt; stages run
//! sequentially inside a single worker while the installed-app row lock is
//! held. Failures never propagate out of the worker loop, they land in the
//! status and timeline columns for the read path to observe.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{error, info, instrument, warn};

use crate::cd::{AppObserved, AppSpecRequest, CdError, ControllerApi, HealthStatus, RefreshType};
use crate::db::{AppLocks, Database};
use crate::error::{AppError, AppResult};
use crate::git::GitOpsApi;
use crate::helm::ReleaseApi;
use crate::models::{
    DeployPayload, DeploymentMode, DeploymentStatus, HistoryStatus, InstalledAppDetail,
    InstalledAppVersion, TimelineStatus,
};
use crate::naming::deployment_name_for;

const TARGET_REVISION: &str = "master";

pub struct DeploymentPipeline {
    db: Database,
    locks: AppLocks,
    controller: Option<Arc<dyn ControllerApi>>,
    release: Arc<dyn ReleaseApi>,
    git: Option<Arc<dyn GitOpsApi>>,
    auto_sync_enabled: bool,
}

impl DeploymentPipeline {
    pub fn new(
        db: Database,
        locks: AppLocks,
        controller: Option<Arc<dyn ControllerApi>>,
        release: Arc<dyn ReleaseApi>,
        git: Option<Arc<dyn GitOpsApi>>,
        auto_sync_enabled: bool,
    ) -> Self {
        Self {
            db,
            locks,
            controller,
            release,
            git,
            auto_sync_enabled,
        }
    }

    pub fn controller(&self) -> Option<&Arc<dyn ControllerApi>> {
        self.controller.as_ref()
    }

    pub fn release_client(&self) -> &Arc<dyn ReleaseApi> {
        &self.release
    }

    /// Start the fixed-size consumer pool for bus-delivered deployments.
    pub fn spawn_workers(self: Arc<Self>, receiver: flume::Receiver<String>, pool_size: usize) {
        for worker in 0..pool_size.max(1) {
            let pipeline = Arc::clone(&self);
            let rx = receiver.clone();
            tokio::spawn(async move {
                info!(worker, "deploy worker started");
                while let Ok(raw) = rx.recv_async().await {
                    let payload: DeployPayload = match serde_json::from_str(&raw) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(worker, "bad deploy payload: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = pipeline.perform_deploy_stage(&payload).await {
                        error!(
                            worker,
                            installed_app_version_id = payload.installed_app_version_id,
                            "deploy stage failed: {e}"
                        );
                    }
                }
                info!(worker, "deploy worker stopped");
            });
        }
    }

    /// Run one deployment attempt end to end.
    #[instrument(skip(self), fields(version_id = payload.installed_app_version_id, history_id = payload.installed_app_version_history_id))]
    pub async fn perform_deploy_stage(&self, payload: &DeployPayload) -> AppResult<()> {
        let history = self
            .db
            .get_history(payload.installed_app_version_history_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "history {} not found",
                    payload.installed_app_version_history_id
                ))
            })?;
        if history.status.is_terminal() {
            // replayed delivery for a finished attempt
            info!("history already terminal, nothing to do");
            return Ok(());
        }

        let version = self
            .db
            .get_version(payload.installed_app_version_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "installed app version {} not found",
                    payload.installed_app_version_id
                ))
            })?;

        let _guard = self.locks.lock(version.installed_app_id).await;

        let detail = self
            .db
            .get_installed_app(version.installed_app_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "installed app {} not found",
                    version.installed_app_id
                ))
            })?;

        if detail.installed_app.delete_requested {
            warn!("delete requested, aborting deployment attempt");
            self.db
                .set_history_status(history.id, HistoryStatus::Aborted, None)
                .await?;
            return Ok(());
        }

        match detail.installed_app.deployment_mode {
            DeploymentMode::GitOps => self.deploy_gitops(&detail, &version, history.id).await,
            DeploymentMode::DirectRelease => {
                self.deploy_direct(&detail, &version, history.id).await
            }
        }
    }

    /// Timeline append plus the paired status writes, in one transaction. A
    /// timeline conflict means an equal-or-newer entry already exists and is
    /// not an error for replays.
    pub(crate) async fn record(
        &self,
        history_id: i64,
        timeline: Option<(TimelineStatus, &str)>,
        history_status: Option<HistoryStatus>,
        installed: Option<(i64, DeploymentStatus)>,
    ) -> AppResult<()> {
        let mut tx = self.db.begin().await?;
        if let Some((status, detail)) = timeline {
            match self
                .db
                .append_timeline(&mut tx, history_id, status, detail, Utc::now())
                .await
            {
                Ok(_) | Err(AppError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(status) = history_status {
            self.db
                .set_history_status_tx(&mut tx, history_id, status, None)
                .await?;
        }
        if let Some((installed_app_id, status)) = installed {
            self.db
                .update_installed_app_status_tx(&mut tx, installed_app_id, status)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn deploy_gitops(
        &self,
        detail: &InstalledAppDetail,
        version: &InstalledAppVersion,
        history_id: i64,
    ) -> AppResult<()> {
        let (controller, git) = match (&self.controller, &self.git) {
            (Some(c), Some(g)) => (c, g),
            _ => {
                self.record(
                    history_id,
                    None,
                    Some(HistoryStatus::Failed),
                    Some((detail.id(), DeploymentStatus::ControllerError)),
                )
                .await?;
                return Err(AppError::internal(
                    "gitops installation requested but gitops is not configured",
                ));
            }
        };

        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        let repo_url = detail.installed_app.git_ops_repo_url.clone();

        self.record(
            history_id,
            Some((
                TimelineStatus::DeploymentInitiated,
                "Deployment initiated successfully.",
            )),
            Some(HistoryStatus::Progressing),
            None,
        )
        .await?;

        let mut status = detail.installed_app.status;
        if status.allows_git_stage() {
            let chart = self
                .db
                .get_chart_version(version.chart_version_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "chart version {} not found",
                        version.chart_version_id
                    ))
                })?;
            match git
                .commit_chart(
                    &repo_url,
                    &name,
                    &chart.chart_reference(),
                    &chart.version,
                    &version.values_yaml,
                )
                .await
            {
                Ok(commit) => {
                    let mut tx = self.db.begin().await?;
                    match self
                        .db
                        .set_history_git_hash(&mut tx, history_id, &commit.commit_hash)
                        .await
                    {
                        Ok(()) => {}
                        Err(AppError::Conflict(_)) => {
                            // identical re-deploy produced the same commit
                            warn!(commit = %commit.commit_hash, "commit hash already recorded");
                        }
                        Err(e) => return Err(e),
                    }
                    self.db
                        .append_timeline(
                            &mut tx,
                            history_id,
                            TimelineStatus::GitCommit,
                            "Git commit done successfully.",
                            Utc::now(),
                        )
                        .await?;
                    self.db
                        .update_installed_app_status_tx(
                            &mut tx,
                            detail.id(),
                            DeploymentStatus::GitSuccess,
                        )
                        .await?;
                    tx.commit().await?;
                    if !self.auto_sync_enabled {
                        self.record(
                            history_id,
                            Some((TimelineStatus::SyncInitiated, "Controller sync initiated.")),
                            None,
                            None,
                        )
                        .await?;
                    }
                    status = DeploymentStatus::GitSuccess;
                }
                Err(e) => {
                    self.record(
                        history_id,
                        Some((
                            TimelineStatus::GitCommitFailed,
                            &format!("Git commit failed - {e}"),
                        )),
                        Some(HistoryStatus::Failed),
                        Some((detail.id(), DeploymentStatus::GitError)),
                    )
                    .await?;
                    return Err(e.into());
                }
            }
        }

        if status.allows_controller_stage() {
            let cluster = self
                .db
                .get_cluster(detail.cluster_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("cluster {} not found", detail.cluster_id))
                })?;
            let spec = AppSpecRequest {
                name: name.clone(),
                repo_url: repo_url.clone(),
                path: name.clone(),
                target_revision: TARGET_REVISION.to_string(),
                dest_server: cluster.server_url.clone(),
                dest_namespace: detail.namespace.clone(),
                auto_sync: self.auto_sync_enabled,
            };
            let result = async {
                controller.register_repo(&repo_url).await?;
                controller.create_app(&spec).await?;
                let observed = controller.get(&name, RefreshType::None).await?;
                if observed.auto_sync_enabled != self.auto_sync_enabled {
                    controller
                        .update_sync_policy(&name, self.auto_sync_enabled)
                        .await?;
                }
                if !self.auto_sync_enabled {
                    controller.sync(&name, TARGET_REVISION, true).await?;
                }
                controller.get(&name, RefreshType::Normal).await
            }
            .await;

            match result {
                Ok(observed) => {
                    self.db
                        .update_installed_app_status(detail.id(), DeploymentStatus::ControllerSuccess)
                        .await?;
                    self.apply_observed(history_id, detail, &observed).await?;
                }
                Err(CdError::InvalidSpec(message)) => {
                    // irrecoverable, keep the controller diagnostic verbatim
                    self.db
                        .set_history_status(
                            history_id,
                            HistoryStatus::Failed,
                            Some(&serde_json::json!({ "error": message })),
                        )
                        .await?;
                    self.db
                        .update_installed_app_status(detail.id(), DeploymentStatus::ControllerError)
                        .await?;
                    return Err(AppError::Irrecoverable(message));
                }
                Err(e) => {
                    self.db
                        .update_installed_app_status(detail.id(), DeploymentStatus::ControllerError)
                        .await?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn deploy_direct(
        &self,
        detail: &InstalledAppDetail,
        version: &InstalledAppVersion,
        history_id: i64,
    ) -> AppResult<()> {
        let chart = self
            .db
            .get_chart_version(version.chart_version_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "chart version {} not found",
                    version.chart_version_id
                ))
            })?;
        let release_name = deployment_name_for(&detail.app_name, &detail.environment_name);

        match self
            .release
            .install(
                &release_name,
                &detail.namespace,
                &chart.chart_reference(),
                &chart.version,
                &version.values_yaml,
            )
            .await
        {
            Ok(release_status) => {
                self.db
                    .set_history_status(history_id, HistoryStatus::Succeeded, Some(&release_status))
                    .await?;
                self.db
                    .update_installed_app_status(detail.id(), DeploymentStatus::Success)
                    .await?;
                info!(release_name, "release deployed");
                Ok(())
            }
            Err(e) => {
                self.db
                    .set_history_status(
                        history_id,
                        HistoryStatus::Failed,
                        Some(&serde_json::json!({ "error": e.to_string() })),
                    )
                    .await?;
                self.db
                    .update_installed_app_status(detail.id(), DeploymentStatus::HelmError)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Fold one controller observation into the history, timeline and
    /// installed-app status. Shared by the deploy path and the reconciler.
    pub async fn apply_observed(
        &self,
        history_id: i64,
        detail: &InstalledAppDetail,
        observed: &AppObserved,
    ) -> AppResult<()> {
        match observed.health {
            HealthStatus::Healthy => {
                let now = Utc::now();
                let latest = self.db.latest_timeline(history_id).await?;
                let mut tx = self.db.begin().await?;
                if latest.map(|t| t.status) != Some(TimelineStatus::KubectlApplySynced) {
                    match self
                        .db
                        .append_timeline(
                            &mut tx,
                            history_id,
                            TimelineStatus::KubectlApplySynced,
                            "Controller applied the desired state.",
                            now,
                        )
                        .await
                    {
                        Ok(_) | Err(AppError::Conflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                match self
                    .db
                    .append_timeline(
                        &mut tx,
                        history_id,
                        TimelineStatus::Healthy,
                        "App is healthy.",
                        now + Duration::milliseconds(1),
                    )
                    .await
                {
                    Ok(_) | Err(AppError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
                self.db
                    .set_history_status_tx(&mut tx, history_id, HistoryStatus::Healthy, None)
                    .await?;
                self.db
                    .update_installed_app_status_tx(&mut tx, detail.id(), DeploymentStatus::Success)
                    .await?;
                tx.commit().await?;
                self.db
                    .upsert_app_status(detail.app_id(), detail.environment_id(), "Healthy")
                    .await?;
                info!(installed_app_id = detail.id(), "deployment healthy");
            }
            HealthStatus::Degraded => {
                self.record(
                    history_id,
                    Some((TimelineStatus::Degraded, "App is degraded.")),
                    Some(HistoryStatus::Degraded),
                    None,
                )
                .await?;
                self.db
                    .upsert_app_status(detail.app_id(), detail.environment_id(), "Degraded")
                    .await?;
            }
            HealthStatus::Progressing => {
                let latest = self.db.latest_timeline(history_id).await?;
                let timeline = (latest.map(|t| t.status)
                    != Some(TimelineStatus::KubectlApplySynced))
                .then_some((
                    TimelineStatus::KubectlApplySynced,
                    "Controller applied the desired state.",
                ));
                self.record(history_id, timeline, Some(HistoryStatus::Progressing), None)
                    .await?;
                self.db
                    .upsert_app_status(detail.app_id(), detail.environment_id(), "Progressing")
                    .await?;
            }
            HealthStatus::Missing | HealthStatus::Unknown | HealthStatus::Suspended => {
                self.record(
                    history_id,
                    Some((
                        TimelineStatus::UnableToFetchStatus,
                        &format!("Controller reported {:?}.", observed.health),
                    )),
                    Some(HistoryStatus::Progressing),
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cd::MockControllerApi;
    use crate::db::installed_apps::tests::{seed_chart, seed_env};
    use crate::db::{NewInstalledApp, NewVersion};
    use crate::git::{GitCommitResult, MockGitOpsApi};
    use crate::helm::{MockReleaseApi, ReleaseError};
    use crate::models::AppType;

    async fn seed_installation(
        db: &Database,
        mode: DeploymentMode,
        repo_url: &str,
    ) -> (DeployPayload, i64) {
        let (_c, env) = seed_env(db).await;
        let chart = seed_chart(db, true).await;
        let mut tx = db.begin().await.unwrap();
        let app_id = db
            .find_or_create_app(&mut tx, "nginx", 1, AppType::ChartStore)
            .await
            .unwrap();
        let installed = db
            .create_installed_app(
                &mut tx,
                &NewInstalledApp {
                    app_id,
                    environment_id: env,
                    deployment_mode: mode,
                    git_ops_repo_url: repo_url.to_string(),
                    is_custom_repo: false,
                    status: DeploymentStatus::DeployInit,
                },
            )
            .await
            .unwrap();
        let version = db
            .promote_version(
                &mut tx,
                installed,
                &NewVersion {
                    chart_version_id: chart,
                    values_yaml: "replicaCount: 2".into(),
                    reference_value_id: None,
                    reference_value_kind: None,
                },
            )
            .await
            .unwrap();
        let history = db.record_deploy_start(&mut tx, version).await.unwrap();
        tx.commit().await.unwrap();
        (
            DeployPayload {
                installed_app_version_id: version,
                installed_app_version_history_id: history,
            },
            installed,
        )
    }

    fn healthy() -> AppObserved {
        AppObserved {
            health: HealthStatus::Healthy,
            auto_sync_enabled: true,
            revision: "abc".into(),
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_direct_release_success() {
        let db = crate::db::test_database().await;
        let (payload, installed) =
            seed_installation(&db, DeploymentMode::DirectRelease, "").await;

        let mut release = MockReleaseApi::new();
        release
            .expect_install()
            .times(1)
            .returning(|_, _, _, _, _| Ok(serde_json::json!({ "info": { "status": "deployed" } })));

        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            None,
            Arc::new(release),
            None,
            true,
        );
        pipeline.perform_deploy_stage(&payload).await.unwrap();

        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(detail.installed_app.status, DeploymentStatus::Success);
        let history = db
            .get_history(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.status, HistoryStatus::Succeeded);
        assert!(history.helm_release_status_config.is_some());
        assert!(history.git_hash.is_empty());
    }

    #[tokio::test]
    async fn test_direct_release_failure_marks_helm_error() {
        let db = crate::db::test_database().await;
        let (payload, installed) =
            seed_installation(&db, DeploymentMode::DirectRelease, "").await;

        let mut release = MockReleaseApi::new();
        release
            .expect_install()
            .returning(|_, _, _, _, _| Err(ReleaseError::Apply("chart is invalid".into())));

        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            None,
            Arc::new(release),
            None,
            true,
        );
        assert!(pipeline.perform_deploy_stage(&payload).await.is_err());

        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(detail.installed_app.status, DeploymentStatus::HelmError);
        let history = db
            .get_history(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn test_gitops_deploy_end_to_end() {
        let db = crate::db::test_database().await;
        let repo = "https://git.example.com/nginx-config";
        let (payload, installed) = seed_installation(&db, DeploymentMode::GitOps, repo).await;

        let mut git = MockGitOpsApi::new();
        git.expect_commit_chart().times(1).returning(|repo, _, _, _, _| {
            Ok(GitCommitResult {
                commit_hash: "deadbeef".into(),
                repo_url: repo.to_string(),
            })
        });

        let mut controller = MockControllerApi::new();
        controller.expect_register_repo().times(1).returning(|_| Ok(()));
        controller.expect_create_app().times(1).returning(|_| Ok(()));
        controller.expect_get().returning(|_, _| Ok(healthy()));

        let release = MockReleaseApi::new();
        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            Some(Arc::new(controller)),
            Arc::new(release),
            Some(Arc::new(git)),
            true,
        );
        pipeline.perform_deploy_stage(&payload).await.unwrap();

        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(detail.installed_app.status, DeploymentStatus::Success);
        assert!(!detail.installed_app.git_ops_repo_url.is_empty());

        let history = db
            .get_history(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.status, HistoryStatus::Healthy);
        assert_eq!(history.git_hash, "deadbeef");
        assert!(history.finished_on.is_some());

        let statuses: Vec<TimelineStatus> = db
            .timelines_for(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TimelineStatus::DeploymentInitiated,
                TimelineStatus::GitCommit,
                TimelineStatus::KubectlApplySynced,
                TimelineStatus::Healthy,
            ]
        );
    }

    #[tokio::test]
    async fn test_manual_sync_adds_sync_initiated_timeline() {
        let db = crate::db::test_database().await;
        let repo = "https://git.example.com/nginx-config";
        let (payload, _installed) = seed_installation(&db, DeploymentMode::GitOps, repo).await;

        let mut git = MockGitOpsApi::new();
        git.expect_commit_chart().returning(|repo, _, _, _, _| {
            Ok(GitCommitResult {
                commit_hash: "deadbeef".into(),
                repo_url: repo.to_string(),
            })
        });
        let mut controller = MockControllerApi::new();
        controller.expect_register_repo().returning(|_| Ok(()));
        controller.expect_create_app().returning(|_| Ok(()));
        // observed auto-sync differs from desired, a policy migration runs
        controller.expect_get().returning(|_, refresh| {
            let mut observed = healthy();
            observed.auto_sync_enabled = refresh == RefreshType::None;
            Ok(observed)
        });
        controller
            .expect_update_sync_policy()
            .times(1)
            .returning(|_, _| Ok(()));
        controller.expect_sync().times(1).returning(|_, _, _| Ok(()));

        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            Some(Arc::new(controller)),
            Arc::new(MockReleaseApi::new()),
            Some(Arc::new(git)),
            false,
        );
        pipeline.perform_deploy_stage(&payload).await.unwrap();

        let statuses: Vec<TimelineStatus> = db
            .timelines_for(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.status)
            .collect();
        assert!(statuses.contains(&TimelineStatus::SyncInitiated));
    }

    #[tokio::test]
    async fn test_git_failure_marks_git_error() {
        let db = crate::db::test_database().await;
        let repo = "https://git.example.com/nginx-config";
        let (payload, installed) = seed_installation(&db, DeploymentMode::GitOps, repo).await;

        let mut git = MockGitOpsApi::new();
        git.expect_commit_chart()
            .returning(|_, _, _, _, _| Err(crate::git::GitError::Push("rejected".into())));
        let mut controller = MockControllerApi::new();
        controller.expect_register_repo().times(0);

        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            Some(Arc::new(controller)),
            Arc::new(MockReleaseApi::new()),
            Some(Arc::new(git)),
            true,
        );
        assert!(pipeline.perform_deploy_stage(&payload).await.is_err());

        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(detail.installed_app.status, DeploymentStatus::GitError);
        let statuses: Vec<TimelineStatus> = db
            .timelines_for(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.status)
            .collect();
        assert!(statuses.contains(&TimelineStatus::GitCommitFailed));
    }

    #[tokio::test]
    async fn test_replay_of_terminal_history_is_noop() {
        let db = crate::db::test_database().await;
        let (payload, _installed) =
            seed_installation(&db, DeploymentMode::DirectRelease, "").await;
        db.set_history_status(
            payload.installed_app_version_history_id,
            HistoryStatus::Succeeded,
            None,
        )
        .await
        .unwrap();

        let mut release = MockReleaseApi::new();
        release.expect_install().times(0);
        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            None,
            Arc::new(release),
            None,
            true,
        );
        pipeline.perform_deploy_stage(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_requested_aborts_attempt() {
        let db = crate::db::test_database().await;
        let (payload, installed) =
            seed_installation(&db, DeploymentMode::DirectRelease, "").await;
        db.mark_for_delete(installed, false).await.unwrap();

        let mut release = MockReleaseApi::new();
        release.expect_install().times(0);
        let pipeline = DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            None,
            Arc::new(release),
            None,
            true,
        );
        pipeline.perform_deploy_stage(&payload).await.unwrap();

        let history = db
            .get_history(payload.installed_app_version_history_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.status, HistoryStatus::Aborted);
    }
}
