//! Single-install lifecycle: create, update, delete, detail, existence and
//! the default cluster-component install.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::auth::{install_policy_key, PolicyApi, RequestCtx};
use crate::bus::{Bus, BULK_DEPLOY_TOPIC};
use crate::cd::ControllerApi;
use crate::db::{AppLocks, ChartVersionRef, Database, NewInstalledApp, NewVersion};
use crate::error::{AppError, AppResult};
use crate::helm::ReleaseApi;
use crate::models::{
    AppExistsEntry, AppType, DeployPayload, DeploymentMode, DeploymentStatus, HistoryStatus,
    InstallAppRequest, InstalledAppFilter, StatusTimeline, UpdateAppRequest,
};
use crate::naming::deployment_name_for;

use super::{default_repo_url, resolve_deployment_mode};

/// Charts installed into every new cluster's default environment.
const DEFAULT_CLUSTER_COMPONENTS: &[&str] = &["metrics-server", "ingress-nginx"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAppDto {
    pub installed_app_id: i64,
    pub app_id: i64,
    pub app_name: String,
    pub environment_id: i64,
    pub environment_name: String,
    pub namespace: String,
    pub deployment_mode: DeploymentMode,
    pub status: DeploymentStatus,
    pub installed_app_version_id: i64,
    pub installed_app_version_history_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAppDetailDto {
    pub installed_app_id: i64,
    pub app_name: String,
    pub environment_id: i64,
    pub environment_name: String,
    pub namespace: String,
    pub deployment_mode: DeploymentMode,
    pub status: DeploymentStatus,
    pub git_ops_repo_url: String,
    pub chart_name: String,
    pub chart_version: String,
    pub values_yaml: String,
    pub last_deployed_status: Option<HistoryStatus>,
    /// Present when the installation came in through a bulk group install.
    pub group_installation_id: Option<String>,
    pub notes: String,
}

pub struct InstallService {
    db: Database,
    bus: Bus,
    locks: AppLocks,
    policy: Arc<dyn PolicyApi>,
    controller: Option<Arc<dyn ControllerApi>>,
    release: Arc<dyn ReleaseApi>,
    gitops_enabled: bool,
    gitops_repo_base_url: Option<String>,
}

impl InstallService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        bus: Bus,
        locks: AppLocks,
        policy: Arc<dyn PolicyApi>,
        controller: Option<Arc<dyn ControllerApi>>,
        release: Arc<dyn ReleaseApi>,
        gitops_enabled: bool,
        gitops_repo_base_url: Option<String>,
    ) -> Self {
        Self {
            db,
            bus,
            locks,
            policy,
            controller,
            release,
            gitops_enabled,
            gitops_repo_base_url,
        }
    }

    /// The referenced chart version; its repository must be active.
    async fn validate_chart(&self, chart_version_id: i64) -> AppResult<ChartVersionRef> {
        let chart = self
            .db
            .get_chart_version(chart_version_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("chart version {chart_version_id} not found"))
            })?;
        if chart.repo_active == 0 {
            return Err(AppError::ChartRepoDisabled(chart.chart_repo_name.clone()));
        }
        Ok(chart)
    }

    async fn authorize(&self, ctx: &RequestCtx, project_id: i64, env_id: i64) -> AppResult<()> {
        let key = install_policy_key(project_id, env_id);
        let decisions = self
            .policy
            .batch_verify(&ctx.auth_token, std::slice::from_ref(&key))
            .await?;
        if decisions.get(&key).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "not authorized for environment {env_id}"
            )))
        }
    }

    /// Publish a deploy message and record the enqueue outcome.
    pub(crate) async fn enqueue(
        &self,
        installed_app_id: i64,
        payload: &DeployPayload,
    ) -> AppResult<DeploymentStatus> {
        let status = match self.bus.publish(BULK_DEPLOY_TOPIC, payload) {
            Ok(()) => DeploymentStatus::Enqueued,
            Err(e) => {
                warn!(installed_app_id, "failed to enqueue deployment: {e}");
                DeploymentStatus::QueueError
            }
        };
        self.db
            .update_installed_app_status(installed_app_id, status)
            .await?;
        Ok(status)
    }

    /// Create an installation and its first version, then hand the attempt
    /// to the deploy workers.
    #[instrument(skip(self, ctx, request), fields(app_name = %request.app_name))]
    pub async fn install(
        &self,
        ctx: &RequestCtx,
        request: &InstallAppRequest,
    ) -> AppResult<InstalledAppDto> {
        if request.app_name.trim().is_empty() {
            return Err(AppError::BadRequest("appName must not be empty".into()));
        }
        self.authorize(ctx, request.team_id, request.environment_id)
            .await?;
        self.validate_chart(request.chart_version_id).await?;
        let env = self
            .db
            .get_environment(request.environment_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("environment {} not found", request.environment_id))
            })?;
        let mode = resolve_deployment_mode(request.deployment_mode, self.gitops_enabled)?;
        let (repo_url, is_custom) = match mode {
            DeploymentMode::GitOps => match &request.git_ops_repo_url {
                Some(url) if !url.is_empty() => (url.clone(), true),
                _ => {
                    let url = default_repo_url(&self.gitops_repo_base_url, &request.app_name);
                    if url.is_empty() {
                        return Err(AppError::BadRequest(
                            "no gitops repository given and no base url configured".into(),
                        ));
                    }
                    (url, false)
                }
            },
            DeploymentMode::DirectRelease => (String::new(), false),
        };

        let mut tx = self.db.begin().await?;
        let app_id = self
            .db
            .find_or_create_app(&mut tx, &request.app_name, request.team_id, AppType::ChartStore)
            .await?;
        let installed_app_id = self
            .db
            .create_installed_app(
                &mut tx,
                &NewInstalledApp {
                    app_id,
                    environment_id: env.id,
                    deployment_mode: mode,
                    git_ops_repo_url: repo_url,
                    is_custom_repo: is_custom,
                    status: DeploymentStatus::DeployInit,
                },
            )
            .await?;
        let version_id = self
            .db
            .promote_version(
                &mut tx,
                installed_app_id,
                &NewVersion {
                    chart_version_id: request.chart_version_id,
                    values_yaml: request.values_yaml.clone(),
                    reference_value_id: request.reference_value_id,
                    reference_value_kind: request.reference_value_kind.clone(),
                },
            )
            .await?;
        let history_id = self.db.record_deploy_start(&mut tx, version_id).await?;
        tx.commit().await?;

        let payload = DeployPayload {
            installed_app_version_id: version_id,
            installed_app_version_history_id: history_id,
        };
        let status = self.enqueue(installed_app_id, &payload).await?;
        info!(installed_app_id, "installation created");

        Ok(InstalledAppDto {
            installed_app_id,
            app_id,
            app_name: request.app_name.clone(),
            environment_id: env.id,
            environment_name: env.environment_name,
            namespace: env.namespace,
            deployment_mode: mode,
            status,
            installed_app_version_id: version_id,
            installed_app_version_history_id: history_id,
        })
    }

    /// Promote a new version of an existing installation.
    #[instrument(skip(self, _ctx, request), fields(installed_app_id = request.installed_app_id))]
    pub async fn update(
        &self,
        _ctx: &RequestCtx,
        request: &UpdateAppRequest,
    ) -> AppResult<InstalledAppDto> {
        let detail = self
            .db
            .get_installed_app(request.installed_app_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "installed app {} not found",
                    request.installed_app_id
                ))
            })?;
        if !detail.installed_app.active {
            return Err(AppError::NotFound(format!(
                "installed app {} not found",
                request.installed_app_id
            )));
        }
        if detail.installed_app.delete_requested {
            return Err(AppError::Conflict(
                "installation is marked for deletion".into(),
            ));
        }
        self.validate_chart(request.chart_version_id).await?;

        let _guard = self.locks.lock(detail.id()).await;
        let mut tx = self.db.begin().await?;
        let version_id = self
            .db
            .promote_version(
                &mut tx,
                detail.id(),
                &NewVersion {
                    chart_version_id: request.chart_version_id,
                    values_yaml: request.values_yaml.clone(),
                    reference_value_id: request.reference_value_id,
                    reference_value_kind: request.reference_value_kind.clone(),
                },
            )
            .await?;
        let history_id = self.db.record_deploy_start(&mut tx, version_id).await?;
        self.db
            .update_installed_app_status_tx(&mut tx, detail.id(), DeploymentStatus::DeployInit)
            .await?;
        tx.commit().await?;

        let payload = DeployPayload {
            installed_app_version_id: version_id,
            installed_app_version_history_id: history_id,
        };
        let status = self.enqueue(detail.id(), &payload).await?;

        let installed_app_id = detail.id();
        let app_id = detail.app_id();
        let environment_id = detail.environment_id();
        Ok(InstalledAppDto {
            installed_app_id,
            app_id,
            app_name: detail.app_name,
            environment_id,
            environment_name: detail.environment_name,
            namespace: detail.namespace,
            deployment_mode: detail.installed_app.deployment_mode,
            status,
            installed_app_version_id: version_id,
            installed_app_version_history_id: history_id,
        })
    }

    /// Cascade delete: remove the release or controller application, then
    /// soft-delete the rows. With `force`, remote failures do not block the
    /// database cleanup.
    #[instrument(skip(self, _ctx))]
    pub async fn delete(
        &self,
        _ctx: &RequestCtx,
        installed_app_id: i64,
        force: bool,
    ) -> AppResult<()> {
        let detail = self
            .db
            .get_installed_app(installed_app_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("installed app {installed_app_id} not found"))
            })?;

        let _guard = self.locks.lock(installed_app_id).await;
        self.db.mark_for_delete(installed_app_id, force).await?;

        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        let remote = match detail.installed_app.deployment_mode {
            DeploymentMode::GitOps => match &self.controller {
                Some(controller) => controller.delete(&name, true).await.map_err(Into::into),
                None => Err(AppError::internal("gitops is not configured")),
            },
            DeploymentMode::DirectRelease => {
                match self
                    .release
                    .delete(detail.cluster_id, &name, &detail.namespace)
                    .await
                {
                    Ok(()) => Ok(()),
                    // already gone, the delete is idempotent
                    Err(e) if e.means_absent() => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        };
        if let Err(e) = remote {
            if force {
                warn!(installed_app_id, "ignoring remote delete failure: {e}");
            } else {
                return Err(e);
            }
        }

        let mut tx = self.db.begin().await?;
        self.db
            .soft_delete_installed_app(&mut tx, installed_app_id)
            .await?;
        self.db
            .mark_chart_group_deployment_deleted(&mut tx, installed_app_id)
            .await?;
        self.db
            .delete_app_status(&mut tx, detail.app_id(), detail.environment_id())
            .await?;
        tx.commit().await?;
        info!(installed_app_id, "installation deleted");
        Ok(())
    }

    /// Remove only the controller application, leaving the cluster resources
    /// and the database rows in place.
    #[instrument(skip(self, _ctx))]
    pub async fn delete_non_cascade(
        &self,
        _ctx: &RequestCtx,
        installed_app_id: i64,
    ) -> AppResult<()> {
        let detail = self
            .db
            .get_installed_app(installed_app_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("installed app {installed_app_id} not found"))
            })?;
        if detail.installed_app.deployment_mode != DeploymentMode::GitOps {
            return Err(AppError::BadRequest(
                "non-cascade delete applies to gitops installations only".into(),
            ));
        }
        let controller = self
            .controller
            .as_ref()
            .ok_or_else(|| AppError::internal("gitops is not configured"))?;
        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        controller.delete(&name, false).await?;
        Ok(())
    }

    pub async fn get_detail(&self, installed_app_id: i64) -> AppResult<InstalledAppDetailDto> {
        let detail = self
            .db
            .get_installed_app(installed_app_id)
            .await?
            .filter(|d| d.installed_app.active)
            .ok_or_else(|| {
                AppError::NotFound(format!("installed app {installed_app_id} not found"))
            })?;
        let version = self
            .db
            .active_version(installed_app_id)
            .await?
            .ok_or_else(|| {
                AppError::internal(format!(
                    "installed app {installed_app_id} has no active version"
                ))
            })?;
        let chart = self
            .db
            .get_chart_version(version.chart_version_id)
            .await?
            .ok_or_else(|| AppError::internal("chart version missing for active version"))?;
        let last = self.db.latest_history_for_version(version.id).await?;
        let group = self.db.find_chart_group_deployment(installed_app_id).await?;
        Ok(InstalledAppDetailDto {
            installed_app_id,
            app_name: detail.app_name,
            environment_id: detail.installed_app.environment_id,
            environment_name: detail.environment_name,
            namespace: detail.namespace,
            deployment_mode: detail.installed_app.deployment_mode,
            status: detail.installed_app.status,
            git_ops_repo_url: detail.installed_app.git_ops_repo_url,
            chart_name: chart.app_store_name,
            chart_version: chart.version,
            values_yaml: version.values_yaml,
            last_deployed_status: last.map(|h| h.status),
            group_installation_id: group.map(|g| g.group_installation_id),
            notes: detail.installed_app.notes,
        })
    }

    pub async fn list(
        &self,
        filter: &InstalledAppFilter,
    ) -> AppResult<Vec<crate::db::InstalledAppListItem>> {
        self.db.list_installed_apps(filter).await
    }

    pub async fn exists(&self, names: &[String]) -> AppResult<Vec<AppExistsEntry>> {
        let existing = self.db.existing_app_names(names).await?;
        Ok(names
            .iter()
            .map(|name| AppExistsEntry {
                name: name.clone(),
                exists: existing.contains(name),
            })
            .collect())
    }

    /// Ordered status timeline of the latest deployment attempt.
    pub async fn deployment_timeline(
        &self,
        installed_app_id: i64,
        env_id: i64,
    ) -> AppResult<Vec<StatusTimeline>> {
        let detail = self
            .db
            .get_installed_app(installed_app_id)
            .await?
            .filter(|d| d.installed_app.environment_id == env_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "installed app {installed_app_id} not found in environment {env_id}"
                ))
            })?;
        let version = self
            .db
            .active_version(detail.id())
            .await?
            .ok_or_else(|| AppError::NotFound("no active version".into()))?;
        let history = self
            .db
            .latest_history_for_version(version.id)
            .await?
            .ok_or_else(|| AppError::NotFound("no deployment attempt recorded".into()))?;
        self.db.timelines_for(history.id).await
    }

    /// Install the default component charts into a cluster's default
    /// environment. Components already present are skipped, so the call is
    /// safe to repeat.
    #[instrument(skip(self, _ctx))]
    pub async fn install_cluster_components(
        &self,
        _ctx: &RequestCtx,
        cluster_id: i64,
    ) -> AppResult<Vec<String>> {
        let env = self
            .db
            .default_environment_for_cluster(cluster_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("cluster {cluster_id} has no default environment"))
            })?;
        let present = self.db.cluster_component_app_names(cluster_id).await?;
        let mut triggered = Vec::new();
        for component in DEFAULT_CLUSTER_COMPONENTS {
            if present.iter().any(|name| name == component) {
                continue;
            }
            let chart = match self.db.find_chart_version_by_name(component).await? {
                Some(chart) => chart,
                None => {
                    warn!(component, "component chart not in catalog, skipping");
                    continue;
                }
            };

            let mut tx = self.db.begin().await?;
            let app_id = self
                .db
                .find_or_create_app(&mut tx, component, 0, AppType::ClusterComponent)
                .await?;
            let installed_app_id = self
                .db
                .create_installed_app(
                    &mut tx,
                    &NewInstalledApp {
                        app_id,
                        environment_id: env.id,
                        deployment_mode: DeploymentMode::DirectRelease,
                        git_ops_repo_url: String::new(),
                        is_custom_repo: false,
                        status: DeploymentStatus::DeployInit,
                    },
                )
                .await?;
            let version_id = self
                .db
                .promote_version(
                    &mut tx,
                    installed_app_id,
                    &NewVersion {
                        chart_version_id: chart.id,
                        values_yaml: String::new(),
                        reference_value_id: None,
                        reference_value_kind: None,
                    },
                )
                .await?;
            let history_id = self.db.record_deploy_start(&mut tx, version_id).await?;
            self.db
                .record_cluster_component(&mut tx, cluster_id, installed_app_id)
                .await?;
            tx.commit().await?;

            let payload = DeployPayload {
                installed_app_version_id: version_id,
                installed_app_version_history_id: history_id,
            };
            self.enqueue(installed_app_id, &payload).await?;
            triggered.push(component.to_string());
        }
        info!(cluster_id, count = triggered.len(), "cluster components triggered");
        Ok(triggered)
    }
}
