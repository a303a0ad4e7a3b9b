//! Periodic status reconciliation. Two sweeps: one refreshes attempts stuck
//! in non-terminal states against the remote, the other declares attempts
//! stuck past the degradation threshold as degraded. Runs single-instance;
//! per-row work fans out with bounded parallelism.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::cd::RefreshType;
use crate::db::{Database, StuckAttempt};
use crate::error::{AppError, AppResult};
use crate::models::{
    DeploymentMode, DeploymentStatus, HistoryStatus, InstalledAppDetail, TimelineStatus,
};
use crate::naming::deployment_name_for;
use crate::pipeline::DeploymentPipeline;

const SWEEP_CONCURRENCY: usize = 4;

pub struct StatusReconciler {
    db: Database,
    pipeline: Arc<DeploymentPipeline>,
    trigger_stale_minutes: i64,
    trigger_abandon_hours: i64,
    pending_since_seconds: i64,
    degradation_minutes: i64,
}

impl StatusReconciler {
    pub fn new(
        db: Database,
        pipeline: Arc<DeploymentPipeline>,
        trigger_stale_minutes: i64,
        trigger_abandon_hours: i64,
        pending_since_seconds: i64,
        degradation_minutes: i64,
    ) -> Self {
        Self {
            db,
            pipeline,
            trigger_stale_minutes,
            trigger_abandon_hours,
            pending_since_seconds,
            degradation_minutes,
        }
    }

    /// Run both sweeps forever on a fixed cadence.
    pub fn spawn(self: Arc<Self>, interval_seconds: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_seconds, "status reconciler started");
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("reconciler pass failed: {e}");
                }
            }
        });
    }

    pub async fn run_once(&self) -> AppResult<()> {
        self.sweep_nonterminal_triggers().await?;
        self.sweep_last_timelines().await?;
        Ok(())
    }

    /// Refresh attempts stuck in a non-terminal state against the remote and
    /// fold the observation back into the store.
    #[instrument(skip(self))]
    pub async fn sweep_nonterminal_triggers(&self) -> AppResult<()> {
        let stuck = self
            .db
            .find_stuck_nonterminal(self.trigger_stale_minutes, self.trigger_abandon_hours)
            .await?;
        if stuck.is_empty() {
            return Ok(());
        }
        debug!(count = stuck.len(), "refreshing stuck attempts");
        futures::stream::iter(stuck)
            .for_each_concurrent(SWEEP_CONCURRENCY, |attempt| async move {
                if let Err(e) = self.refresh_attempt(&attempt).await {
                    warn!(history_id = attempt.history_id, "refresh failed: {e}");
                }
            })
            .await;
        Ok(())
    }

    async fn load_detail(&self, attempt: &StuckAttempt) -> AppResult<InstalledAppDetail> {
        self.db
            .get_installed_app(attempt.installed_app_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "installed app {} not found",
                    attempt.installed_app_id
                ))
            })
    }

    async fn refresh_attempt(&self, attempt: &StuckAttempt) -> AppResult<()> {
        let detail = self.load_detail(attempt).await?;
        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        match detail.installed_app.deployment_mode {
            DeploymentMode::GitOps => {
                let controller = match self.pipeline.controller() {
                    Some(c) => c,
                    None => return Ok(()),
                };
                match controller.get(&name, RefreshType::Normal).await {
                    Ok(observed) => {
                        self.pipeline
                            .apply_observed(attempt.history_id, &detail, &observed)
                            .await?;
                    }
                    Err(e) if e.means_absent() => {
                        // deleted externally; the attempt can never converge
                        self.pipeline
                            .record(
                                attempt.history_id,
                                Some((
                                    TimelineStatus::UnableToFetchStatus,
                                    "Application is gone from the controller.",
                                )),
                                Some(HistoryStatus::Failed),
                                None,
                            )
                            .await?;
                    }
                    Err(e) => {
                        self.pipeline
                            .record(
                                attempt.history_id,
                                Some((
                                    TimelineStatus::FetchTimedOut,
                                    &format!("Failed to fetch status - {e}"),
                                )),
                                None,
                                None,
                            )
                            .await?;
                    }
                }
            }
            DeploymentMode::DirectRelease => {
                match self
                    .pipeline
                    .release_client()
                    .get_detail(detail.cluster_id, &name, &detail.namespace)
                    .await
                {
                    Ok(release_status) => {
                        self.db
                            .set_history_status(
                                attempt.history_id,
                                HistoryStatus::Succeeded,
                                Some(&release_status),
                            )
                            .await?;
                        self.db
                            .update_installed_app_status(detail.id(), DeploymentStatus::Success)
                            .await?;
                    }
                    Err(e) if e.means_absent() => {
                        self.db
                            .set_history_status(attempt.history_id, HistoryStatus::Failed, None)
                            .await?;
                    }
                    Err(e) => {
                        warn!(history_id = attempt.history_id, "release detail failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    /// Declare attempts degraded whose last timeline has sat in an
    /// applied/fetch-failed state past the threshold.
    #[instrument(skip(self))]
    pub async fn sweep_last_timelines(&self) -> AppResult<()> {
        let stuck = self
            .db
            .find_stuck_on_last_timeline(self.pending_since_seconds, self.degradation_minutes)
            .await?;
        if stuck.is_empty() {
            return Ok(());
        }
        debug!(count = stuck.len(), "degrading stalled attempts");
        futures::stream::iter(stuck)
            .for_each_concurrent(SWEEP_CONCURRENCY, |attempt| async move {
                if let Err(e) = self.degrade_attempt(&attempt).await {
                    warn!(history_id = attempt.history_id, "degrade failed: {e}");
                }
            })
            .await;
        Ok(())
    }

    async fn degrade_attempt(&self, attempt: &StuckAttempt) -> AppResult<()> {
        let detail = self.load_detail(attempt).await?;
        self.pipeline
            .record(
                attempt.history_id,
                Some((
                    TimelineStatus::Degraded,
                    "Deployment did not become healthy within the degradation threshold.",
                )),
                Some(HistoryStatus::Degraded),
                None,
            )
            .await?;
        self.db
            .upsert_app_status(detail.app_id(), detail.environment_id(), "Degraded")
            .await?;
        info!(history_id = attempt.history_id, "attempt degraded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cd::{AppObserved, HealthStatus, MockControllerApi};
    use crate::db::installed_apps::tests::{seed_chart, seed_env};
    use crate::db::{AppLocks, NewInstalledApp, NewVersion};
    use crate::helm::MockReleaseApi;
    use crate::models::AppType;
    use chrono::{Duration as ChronoDuration, Utc};

    async fn seed_stuck_gitops(db: &Database) -> (i64, i64) {
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
                    deployment_mode: DeploymentMode::GitOps,
                    git_ops_repo_url: "https://git.example.com/nginx".into(),
                    is_custom_repo: false,
                    status: DeploymentStatus::ControllerSuccess,
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
                    values_yaml: String::new(),
                    reference_value_id: None,
                    reference_value_kind: None,
                },
            )
            .await
            .unwrap();
        let history = db.record_deploy_start(&mut tx, version).await.unwrap();
        tx.commit().await.unwrap();
        (installed, history)
    }

    fn reconciler_with(
        db: &Database,
        controller: MockControllerApi,
    ) -> StatusReconciler {
        let pipeline = Arc::new(DeploymentPipeline::new(
            db.clone(),
            AppLocks::new(),
            Some(Arc::new(controller)),
            Arc::new(MockReleaseApi::new()),
            None,
            true,
        ));
        StatusReconciler::new(db.clone(), pipeline, 5, 12, 300, 10)
    }

    async fn age_history(db: &Database, history: i64, minutes: i64) {
        let aged = (Utc::now() - ChronoDuration::minutes(minutes)).to_rfc3339();
        sqlx::query("UPDATE installed_app_version_history SET updated_on = ? WHERE id = ?")
            .bind(&aged)
            .bind(history)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nonterminal_sweep_promotes_healthy() {
        let db = crate::db::test_database().await;
        let (installed, history) = seed_stuck_gitops(&db).await;
        age_history(&db, history, 20).await;

        let mut controller = MockControllerApi::new();
        controller.expect_get().times(1).returning(|_, _| {
            Ok(AppObserved {
                health: HealthStatus::Healthy,
                auto_sync_enabled: true,
                revision: "abc".into(),
                message: String::new(),
            })
        });
        let reconciler = reconciler_with(&db, controller);
        reconciler.sweep_nonterminal_triggers().await.unwrap();

        let row = db.get_history(history).await.unwrap().unwrap();
        assert_eq!(row.status, HistoryStatus::Healthy);
        assert!(row.finished_on.is_some());
        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(detail.installed_app.status, DeploymentStatus::Success);
        assert_eq!(
            db.get_app_status(detail.app_id(), detail.environment_id())
                .await
                .unwrap()
                .as_deref(),
            Some("Healthy")
        );
    }

    #[tokio::test]
    async fn test_last_timeline_sweep_degrades_stalled_attempt() {
        let db = crate::db::test_database().await;
        let (installed, history) = seed_stuck_gitops(&db).await;

        // applied 20 minutes ago, history touched 5 minutes ago,
        // degradation threshold 10 minutes
        let applied_at = Utc::now() - ChronoDuration::minutes(20);
        let mut tx = db.begin().await.unwrap();
        db.append_timeline(
            &mut tx,
            history,
            TimelineStatus::KubectlApplySynced,
            "applied",
            applied_at,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        age_history(&db, history, 5).await;

        let reconciler = reconciler_with(&db, MockControllerApi::new());
        reconciler.sweep_last_timelines().await.unwrap();

        let row = db.get_history(history).await.unwrap().unwrap();
        assert_eq!(row.status, HistoryStatus::Degraded);
        assert!(row.finished_on.is_some());
        let latest = db.latest_timeline(history).await.unwrap().unwrap();
        assert_eq!(latest.status, TimelineStatus::Degraded);
        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(
            db.get_app_status(detail.app_id(), detail.environment_id())
                .await
                .unwrap()
                .as_deref(),
            Some("Degraded")
        );
    }

    #[tokio::test]
    async fn test_abandoned_rows_are_not_swept() {
        let db = crate::db::test_database().await;
        let (_installed, history) = seed_stuck_gitops(&db).await;
        age_history(&db, history, 60 * 24).await;

        let mut controller = MockControllerApi::new();
        controller.expect_get().times(0);
        let reconciler = reconciler_with(&db, controller);
        reconciler.sweep_nonterminal_triggers().await.unwrap();

        let row = db.get_history(history).await.unwrap().unwrap();
        assert_eq!(row.status, HistoryStatus::Init);
    }
}
