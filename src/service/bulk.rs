//! Bulk group installs: batched authorization, one transaction for the
//! whole batch, then fan-out over the deploy bus.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{info, instrument};

use crate::auth::{install_policy_key, PolicyApi, RequestCtx};
use crate::bus::{Bus, BULK_DEPLOY_TOPIC};
use crate::db::{Database, NewInstalledApp, NewVersion};
use crate::error::{AppError, AppResult};
use crate::models::{
    AppType, ChartGroupInstallChartRequest, ChartGroupInstallRequest, DeployPayload,
    DeploymentMode, DeploymentStatus,
};

use super::{default_repo_url, resolve_deployment_mode};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkItemOutcome {
    Enqueued,
    QueueError,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemStatus {
    pub app_name: String,
    pub environment_id: i64,
    pub outcome: BulkItemOutcome,
    pub reason: String,
}

/// The authorization report and the enqueue outcome are both surfaced,
/// independently: rejected items carry the policy reason, authorized items
/// carry how their publish went.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartGroupInstallAppRes {
    pub summary: String,
    pub items: Vec<BulkItemStatus>,
}

/// Content-addressed id of a batch: sha1 over the sorted participating app
/// ids. Compatibility identifier, not a security primitive.
pub fn group_installation_id(app_ids: &[i64]) -> String {
    let mut sorted = app_ids.to_vec();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for id in sorted {
        hasher.update(id.to_string().as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub struct BulkService {
    db: Database,
    bus: Bus,
    policy: Arc<dyn PolicyApi>,
    gitops_enabled: bool,
    gitops_repo_base_url: Option<String>,
}

impl BulkService {
    pub fn new(
        db: Database,
        bus: Bus,
        policy: Arc<dyn PolicyApi>,
        gitops_enabled: bool,
        gitops_repo_base_url: Option<String>,
    ) -> Self {
        Self {
            db,
            bus,
            policy,
            gitops_enabled,
            gitops_repo_base_url,
        }
    }

    fn validate(&self, request: &ChartGroupInstallRequest) -> AppResult<()> {
        if request.charts.is_empty() {
            return Err(AppError::BadRequest("no charts in request".into()));
        }
        let mut seen = HashSet::new();
        for chart in &request.charts {
            if chart.app_name.trim().is_empty() {
                return Err(AppError::BadRequest("appName must not be empty".into()));
            }
            if !seen.insert(chart.app_name.clone()) {
                return Err(AppError::BadRequest(format!(
                    "duplicate appName {} in batch",
                    chart.app_name
                )));
            }
        }
        Ok(())
    }

    /// All referenced chart repositories must be active before anything is
    /// written.
    async fn validate_charts_active(&self, request: &ChartGroupInstallRequest) -> AppResult<()> {
        for chart in &request.charts {
            let version = self
                .db
                .get_chart_version(chart.chart_version_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "chart version {} not found",
                        chart.chart_version_id
                    ))
                })?;
            if version.repo_active == 0 {
                return Err(AppError::ChartRepoDisabled(version.chart_repo_name));
            }
        }
        Ok(())
    }

    /// Partition the batch by the policy engine's decision map. The two
    /// halves are disjoint and cover the input.
    async fn partition_authorized<'a>(
        &self,
        ctx: &RequestCtx,
        project_id: i64,
        charts: &'a [ChartGroupInstallChartRequest],
    ) -> AppResult<(
        Vec<&'a ChartGroupInstallChartRequest>,
        Vec<&'a ChartGroupInstallChartRequest>,
    )> {
        let keys: Vec<String> = charts
            .iter()
            .map(|c| install_policy_key(project_id, c.environment_id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let decisions = self.policy.batch_verify(&ctx.auth_token, &keys).await?;
        let mut authorized = Vec::new();
        let mut rejected = Vec::new();
        for chart in charts {
            let key = install_policy_key(project_id, chart.environment_id);
            if decisions.get(&key).copied().unwrap_or(false) {
                authorized.push(chart);
            } else {
                rejected.push(chart);
            }
        }
        Ok((authorized, rejected))
    }

    #[instrument(skip(self, ctx, request), fields(charts = request.charts.len()))]
    pub async fn deploy_bulk(
        &self,
        ctx: &RequestCtx,
        request: &ChartGroupInstallRequest,
    ) -> AppResult<ChartGroupInstallAppRes> {
        self.validate(request)?;
        self.validate_charts_active(request).await?;

        let (authorized, rejected) = self
            .partition_authorized(ctx, request.project_id, &request.charts)
            .await?;

        let mode = resolve_deployment_mode(None, self.gitops_enabled)?;

        // environments resolved before the batch transaction opens
        let mut resolved = Vec::with_capacity(authorized.len());
        for chart in &authorized {
            let env = self
                .db
                .get_environment(chart.environment_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "environment {} not found",
                        chart.environment_id
                    ))
                })?;
            resolved.push((*chart, env));
        }

        let mut created: Vec<(i64, DeployPayload, &ChartGroupInstallChartRequest)> = Vec::new();
        let mut tx = self.db.begin().await?;
        let mut app_ids = Vec::new();
        for (chart, env) in &resolved {
            let repo_url = match mode {
                DeploymentMode::GitOps => {
                    let url = default_repo_url(&self.gitops_repo_base_url, &chart.app_name);
                    if url.is_empty() {
                        return Err(AppError::BadRequest(
                            "no gitops base url configured for bulk install".into(),
                        ));
                    }
                    url
                }
                DeploymentMode::DirectRelease => String::new(),
            };
            let app_id = self
                .db
                .find_or_create_app(&mut tx, &chart.app_name, request.project_id, AppType::ChartStore)
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
                        chart_version_id: chart.chart_version_id,
                        values_yaml: chart.values_yaml.clone().unwrap_or_default(),
                        reference_value_id: chart.reference_value_id,
                        reference_value_kind: chart.reference_value_kind.clone(),
                    },
                )
                .await?;
            let history_id = self.db.record_deploy_start(&mut tx, version_id).await?;
            app_ids.push(app_id);
            created.push((
                installed_app_id,
                DeployPayload {
                    installed_app_version_id: version_id,
                    installed_app_version_history_id: history_id,
                },
                *chart,
            ));
        }
        if let Some(chart_group_id) = request.chart_group_id {
            let group_id = group_installation_id(&app_ids);
            for (installed_app_id, _, chart) in &created {
                self.db
                    .save_chart_group_deployment(
                        &mut tx,
                        chart_group_id,
                        chart.chart_group_entry_id,
                        *installed_app_id,
                        &group_id,
                    )
                    .await?;
            }
        }
        tx.commit().await?;

        let mut items = Vec::with_capacity(request.charts.len());
        for (installed_app_id, payload, chart) in &created {
            let status = match self.bus.publish(BULK_DEPLOY_TOPIC, payload) {
                Ok(()) => DeploymentStatus::Enqueued,
                Err(_) => DeploymentStatus::QueueError,
            };
            self.db
                .update_installed_app_status(*installed_app_id, status)
                .await?;
            items.push(BulkItemStatus {
                app_name: chart.app_name.clone(),
                environment_id: chart.environment_id,
                outcome: if status == DeploymentStatus::Enqueued {
                    BulkItemOutcome::Enqueued
                } else {
                    BulkItemOutcome::QueueError
                },
                reason: String::new(),
            });
        }
        for chart in &rejected {
            items.push(BulkItemStatus {
                app_name: chart.app_name.clone(),
                environment_id: chart.environment_id,
                outcome: BulkItemOutcome::Rejected,
                reason: "unauthorized".into(),
            });
        }

        let summary = format!("{}/{} failed to trigger", rejected.len(), request.charts.len());
        info!(summary, "bulk install processed");
        Ok(ChartGroupInstallAppRes { summary, items })
    }
}
