//! Deployment-mode migration: retarget all active installations of an
//! environment from one delivery mode to the other, in two calls. The first
//! deletes the old-mode resource and commits the new mode to the database;
//! the second verifies the old resource is gone and re-triggers deployment.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::bus::{Bus, BULK_DEPLOY_TOPIC};
use crate::cd::{ControllerApi, RefreshType};
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::helm::ReleaseApi;
use crate::k8s::K8sClient;
use crate::models::{
    DeployPayload, DeploymentChangeStatus, DeploymentMode, DeploymentStatus, InstalledAppDetail,
    MigrationRequest, MigrationResponse, MigrationStatus,
};
use crate::naming::deployment_name_for;

const FAILED_TO_DELETE_PREFIX: &str = "failed to delete app: ";
const APP_NOT_DELETED_YET: &str = "app not deleted yet";
const MISSING_NAME_OR_ENV: &str = "could not fetch app name or environment name";

const HELM_RELEASE_NAME_ANNOTATION: &str = "meta.helm.sh/release-name";
const HELM_RELEASE_NAMESPACE_ANNOTATION: &str = "meta.helm.sh/release-namespace";
const CRD_KIND: &str = "CustomResourceDefinition";

pub struct MigrationService {
    db: Database,
    bus: Bus,
    controller: Option<Arc<dyn ControllerApi>>,
    release: Arc<dyn ReleaseApi>,
    k8s: Option<K8sClient>,
    gitops_enabled: bool,
    repo_base_url: Option<String>,
}

fn change_status(detail: &InstalledAppDetail, error: &str, status: MigrationStatus) -> DeploymentChangeStatus {
    DeploymentChangeStatus {
        installed_app_id: detail.id(),
        app_id: detail.app_id(),
        app_name: detail.app_name.clone(),
        env_id: detail.environment_id(),
        env_name: detail.environment_name.clone(),
        error: error.to_string(),
        status,
    }
}

impl MigrationService {
    pub fn new(
        db: Database,
        bus: Bus,
        controller: Option<Arc<dyn ControllerApi>>,
        release: Arc<dyn ReleaseApi>,
        k8s: Option<K8sClient>,
        gitops_enabled: bool,
        repo_base_url: Option<String>,
    ) -> Self {
        Self {
            db,
            bus,
            controller,
            release,
            k8s,
            gitops_enabled,
            repo_base_url,
        }
    }

    fn controller(&self) -> AppResult<&Arc<dyn ControllerApi>> {
        self.controller
            .as_ref()
            .ok_or_else(|| AppError::internal("gitops is not configured"))
    }

    /// Phases 1 and 2: delete each installation's old-mode resource and flip
    /// the surviving rows to the desired mode.
    #[instrument(skip(self, request), fields(env_id = request.env_id))]
    pub async fn migrate_deployment_type(
        &self,
        request: &MigrationRequest,
    ) -> AppResult<MigrationResponse> {
        let desired = request.desired_deployment_mode;
        let mut response = MigrationResponse::new(request.env_id, desired);
        let (delete_mode, committed_status) = match desired {
            DeploymentMode::GitOps => (DeploymentMode::DirectRelease, DeploymentStatus::DeployInit),
            DeploymentMode::DirectRelease => (DeploymentMode::GitOps, DeploymentStatus::Success),
        };

        let env = self
            .db
            .get_environment(request.env_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("environment {} not found", request.env_id))
            })?;
        let cluster = self
            .db
            .get_cluster(env.cluster_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("cluster {} not found", env.cluster_id)))?;
        // a delete sent towards an unreachable cluster would wedge in
        // deleting state, block the whole migration instead
        if !cluster.is_reachable() {
            return Err(AppError::ClusterUnreachable(cluster.error_in_connecting));
        }
        if desired == DeploymentMode::GitOps && !self.gitops_enabled {
            return Err(AppError::BadRequest(
                "gitops not configured or unable to fetch gitops configuration".into(),
            ));
        }

        let candidates = self
            .db
            .active_by_env_and_mode(
                request.env_id,
                delete_mode,
                &request.include_apps,
                &request.exclude_apps,
            )
            .await?;
        if candidates.is_empty() {
            return Err(AppError::NotFound(format!(
                "no installed apps found for this desired deployment type {desired}"
            )));
        }

        if desired == DeploymentMode::DirectRelease {
            // stamp Helm ownership onto CRDs first, otherwise the later
            // direct install fails with "CRD already exists"
            for candidate in &candidates {
                self.annotate_crds_if_exist(candidate).await?;
            }
        }

        for candidate in &candidates {
            match self.delete_in_old_mode(candidate).await {
                Ok(()) => {
                    response
                        .successful_pipelines
                        .push(change_status(candidate, "", MigrationStatus::Initiated));
                }
                Err(e) => {
                    warn!(installed_app_id = candidate.id(), "old-mode delete failed: {e}");
                    response.failed_pipelines.push(change_status(
                        candidate,
                        &format!("{FAILED_TO_DELETE_PREFIX}{e}"),
                        MigrationStatus::Failed,
                    ));
                }
            }
        }

        let success_ids: Vec<i64> = response
            .successful_pipelines
            .iter()
            .map(|p| p.installed_app_id)
            .collect();
        let success_app_ids: Vec<i64> = response
            .successful_pipelines
            .iter()
            .map(|p| p.app_id)
            .collect();

        let mut tx = self.db.begin().await?;
        self.db
            .update_deployment_mode_for(&mut tx, &success_ids, desired, committed_status)
            .await?;
        if desired == DeploymentMode::GitOps {
            self.db
                .update_offering_mode_full(&mut tx, &success_app_ids)
                .await?;
            // newly gitops installations need a repository to deploy from
            for candidate in &candidates {
                if success_ids.contains(&candidate.id())
                    && candidate.installed_app.git_ops_repo_url.is_empty()
                {
                    let url = super::default_repo_url(&self.repo_base_url, &candidate.app_name);
                    if !url.is_empty() {
                        self.db
                            .set_gitops_repo_url(&mut tx, candidate.id(), &url)
                            .await?;
                    }
                }
            }
        }
        tx.commit().await?;

        info!(
            migrated = response.successful_pipelines.len(),
            failed = response.failed_pipelines.len(),
            "deployment type migration committed"
        );
        Ok(response)
    }

    async fn delete_in_old_mode(&self, detail: &InstalledAppDetail) -> AppResult<()> {
        if detail.app_name.is_empty() || detail.environment_name.is_empty() {
            return Err(AppError::internal(MISSING_NAME_OR_ENV));
        }
        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        match detail.installed_app.deployment_mode {
            DeploymentMode::GitOps => {
                // a blank cached status means "never observed" and is fine;
                // a read failure is not
                if let Err(e) = self
                    .db
                    .get_app_status(detail.app_id(), detail.environment_id())
                    .await
                {
                    return Err(AppError::internal(format!("unable to fetch app status: {e}")));
                }
                self.controller()?.delete(&name, false).await?;
            }
            DeploymentMode::DirectRelease => {
                match self
                    .release
                    .delete(detail.cluster_id, &name, &detail.namespace)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.means_absent() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Patch Helm ownership annotations onto every CRD in the live resource
    /// tree of a GitOps installation.
    pub(crate) async fn annotate_crds_if_exist(
        &self,
        detail: &InstalledAppDetail,
    ) -> AppResult<()> {
        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        let tree = self
            .controller()?
            .resource_tree(&name)
            .await
            .map_err(|e| {
                AppError::NotFound(format!("failed to get resource tree from controller: {e}"))
            })?;
        let crds: Vec<_> = tree.into_iter().filter(|n| n.kind == CRD_KIND).collect();
        if crds.is_empty() {
            return Ok(());
        }
        let k8s = self
            .k8s
            .as_ref()
            .ok_or_else(|| AppError::internal("kubernetes client is not configured"))?;
        let annotations: BTreeMap<String, String> = [
            (
                HELM_RELEASE_NAME_ANNOTATION.to_string(),
                detail.app_name.clone(),
            ),
            (
                HELM_RELEASE_NAMESPACE_ANNOTATION.to_string(),
                detail.namespace.clone(),
            ),
        ]
        .into_iter()
        .collect();
        for crd in crds {
            k8s.annotate_cluster_resource(
                &crd.group,
                &crd.version,
                &crd.kind,
                &crd.name,
                annotations.clone(),
            )
            .await?;
        }
        Ok(())
    }

    /// Phase 3: for migrated installations whose old resource is confirmed
    /// gone, refresh the last-deployed marker and re-publish to the deploy
    /// bus. Installations still present are reported for the caller to
    /// retry.
    #[instrument(skip(self, request), fields(env_id = request.env_id))]
    pub async fn trigger_after_migration(
        &self,
        request: &MigrationRequest,
    ) -> AppResult<MigrationResponse> {
        let desired = request.desired_deployment_mode;
        let mut response = MigrationResponse::new(request.env_id, desired);

        let migrated = self
            .db
            .active_by_env_and_mode(
                request.env_id,
                desired,
                &request.include_apps,
                &request.exclude_apps,
            )
            .await?;
        if migrated.is_empty() {
            return Ok(response);
        }

        let mut confirmed = Vec::new();
        for detail in &migrated {
            if self.old_resource_gone(detail, desired).await {
                confirmed.push(detail);
                response
                    .successful_pipelines
                    .push(change_status(detail, "", MigrationStatus::Success));
            } else {
                response.failed_pipelines.push(change_status(
                    detail,
                    APP_NOT_DELETED_YET,
                    MigrationStatus::NotYetDeleted,
                ));
            }
        }

        for detail in &confirmed {
            if let Err(e) = self.trigger_one(detail, desired).await {
                warn!(installed_app_id = detail.id(), "re-trigger failed: {e}");
            }
        }

        if desired == DeploymentMode::DirectRelease {
            // the controller no longer owns these apps, drop the cached rows
            let mut tx = self.db.begin().await?;
            for detail in &confirmed {
                self.db
                    .delete_app_status(&mut tx, detail.app_id(), detail.environment_id())
                    .await?;
            }
            tx.commit().await?;
        }

        Ok(response)
    }

    /// Whether the pre-migration resource has actually disappeared.
    async fn old_resource_gone(&self, detail: &InstalledAppDetail, desired: DeploymentMode) -> bool {
        let name = deployment_name_for(&detail.app_name, &detail.environment_name);
        match desired {
            // old mode was direct release
            DeploymentMode::GitOps => match self
                .release
                .get_detail(detail.cluster_id, &name, &detail.namespace)
                .await
            {
                Err(e) => e.means_absent(),
                Ok(_) => false,
            },
            // old mode was gitops
            DeploymentMode::DirectRelease => match self.controller() {
                Ok(controller) => match controller.get(&name, RefreshType::None).await {
                    Err(e) => e.means_absent(),
                    Ok(_) => false,
                },
                Err(_) => false,
            },
        }
    }

    async fn trigger_one(
        &self,
        detail: &InstalledAppDetail,
        desired: DeploymentMode,
    ) -> AppResult<()> {
        let version = self
            .db
            .active_version(detail.id())
            .await?
            .ok_or_else(|| AppError::internal("no active version for migrated app"))?;
        let history = match self.db.latest_history_for_version(version.id).await? {
            Some(history) => history,
            None => {
                let mut tx = self.db.begin().await?;
                let id = self.db.record_deploy_start(&mut tx, version.id).await?;
                tx.commit().await?;
                self.db
                    .get_history(id)
                    .await?
                    .ok_or_else(|| AppError::internal("history row vanished"))?
            }
        };

        // the UI shows "last deployed" from different tables per mode
        match desired {
            DeploymentMode::DirectRelease => self.db.touch_version(version.id).await?,
            DeploymentMode::GitOps => self.db.touch_history(history.id).await?,
        }

        let payload = DeployPayload {
            installed_app_version_id: version.id,
            installed_app_version_history_id: history.id,
        };
        let status = match self.bus.publish(BULK_DEPLOY_TOPIC, &payload) {
            Ok(()) => DeploymentStatus::Enqueued,
            Err(_) => DeploymentStatus::QueueError,
        };
        if matches!(
            detail.installed_app.status,
            DeploymentStatus::DeployInit | DeploymentStatus::QueueError | DeploymentStatus::Enqueued
        ) {
            self.db
                .update_installed_app_status(detail.id(), status)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cd::{CdError, MockControllerApi, ResourceRef};
    use crate::db::installed_apps::tests::{seed_chart, seed_env};
    use crate::db::{NewInstalledApp, NewVersion};
    use crate::helm::MockReleaseApi;
    use crate::models::AppType;

    async fn seed_installed(
        db: &Database,
        env: i64,
        name: &str,
        mode: DeploymentMode,
        status: DeploymentStatus,
    ) -> i64 {
        let chart = seed_chart(db, true).await;
        let mut tx = db.begin().await.unwrap();
        let app_id = db
            .find_or_create_app(&mut tx, name, 1, AppType::ChartStore)
            .await
            .unwrap();
        let installed = db
            .create_installed_app(
                &mut tx,
                &NewInstalledApp {
                    app_id,
                    environment_id: env,
                    deployment_mode: mode,
                    git_ops_repo_url: if mode == DeploymentMode::GitOps {
                        "https://git.example.com/seeded".to_string()
                    } else {
                        String::new()
                    },
                    is_custom_repo: false,
                    status,
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
        db.record_deploy_start(&mut tx, version).await.unwrap();
        tx.commit().await.unwrap();
        installed
    }

    fn request(env: i64, desired: DeploymentMode) -> MigrationRequest {
        MigrationRequest {
            env_id: env,
            desired_deployment_mode: desired,
            include_apps: Vec::new(),
            exclude_apps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_cluster_blocks_migration() {
        let db = crate::db::test_database().await;
        let (cluster, env) = seed_env(&db).await;
        sqlx::query("UPDATE cluster SET error_in_connecting = 'dial timeout' WHERE id = ?")
            .bind(cluster)
            .execute(db.pool())
            .await
            .unwrap();
        let installed = seed_installed(
            &db,
            env,
            "nginx",
            DeploymentMode::DirectRelease,
            DeploymentStatus::Success,
        )
        .await;

        let service = MigrationService::new(
            db.clone(),
            Bus::new(),
            Some(Arc::new(MockControllerApi::new())),
            Arc::new(MockReleaseApi::new()),
            None,
            true,
            Some("https://git.example.com/gitops".into()),
        );
        let err = service
            .migrate_deployment_type(&request(env, DeploymentMode::GitOps))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ClusterUnreachable(_)));

        // nothing was modified
        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(
            detail.installed_app.deployment_mode,
            DeploymentMode::DirectRelease
        );
    }

    #[tokio::test]
    async fn test_migrate_helm_to_gitops_flips_mode_and_offering() {
        let db = crate::db::test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        let installed = seed_installed(
            &db,
            env,
            "nginx",
            DeploymentMode::DirectRelease,
            DeploymentStatus::Success,
        )
        .await;

        let mut release = MockReleaseApi::new();
        release.expect_delete().times(1).returning(|_, _, _| Ok(()));
        let service = MigrationService::new(
            db.clone(),
            Bus::new(),
            Some(Arc::new(MockControllerApi::new())),
            Arc::new(release),
            None,
            true,
            Some("https://git.example.com/gitops".into()),
        );
        let response = service
            .migrate_deployment_type(&request(env, DeploymentMode::GitOps))
            .await
            .unwrap();

        assert_eq!(response.successful_pipelines.len(), 1);
        assert_eq!(
            response.successful_pipelines[0].status,
            MigrationStatus::Initiated
        );
        assert!(response.failed_pipelines.is_empty());

        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(detail.installed_app.deployment_mode, DeploymentMode::GitOps);
        assert_eq!(detail.installed_app.status, DeploymentStatus::DeployInit);
        assert!(!detail.installed_app.git_ops_repo_url.is_empty());
        let offering: (String,) = sqlx::query_as("SELECT app_offering_mode FROM app WHERE id = ?")
            .bind(detail.app_id())
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(offering.0, "FULL");
    }

    #[tokio::test]
    async fn test_migrate_gitops_to_helm_deletes_controller_app() {
        let db = crate::db::test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        let installed = seed_installed(
            &db,
            env,
            "nginx",
            DeploymentMode::GitOps,
            DeploymentStatus::Success,
        )
        .await;

        let mut controller = MockControllerApi::new();
        controller
            .expect_resource_tree()
            .times(1)
            .returning(|_| Ok(Vec::new()));
        controller
            .expect_delete()
            .times(1)
            .withf(|name, cascade| name == "nginx-dev" && !cascade)
            .returning(|_, _| Ok(()));
        let service = MigrationService::new(
            db.clone(),
            Bus::new(),
            Some(Arc::new(controller)),
            Arc::new(MockReleaseApi::new()),
            None,
            true,
            None,
        );
        let response = service
            .migrate_deployment_type(&request(env, DeploymentMode::DirectRelease))
            .await
            .unwrap();
        assert_eq!(response.successful_pipelines.len(), 1);

        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(
            detail.installed_app.deployment_mode,
            DeploymentMode::DirectRelease
        );
        assert_eq!(detail.installed_app.status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn test_crd_annotation_failure_blocks_before_any_delete() {
        let db = crate::db::test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        seed_installed(
            &db,
            env,
            "nginx",
            DeploymentMode::GitOps,
            DeploymentStatus::Success,
        )
        .await;

        let mut controller = MockControllerApi::new();
        // a CRD is present but no kubernetes client is configured, the
        // annotation pre-step must fail and nothing may be deleted
        controller.expect_resource_tree().returning(|_| {
            Ok(vec![ResourceRef {
                group: "apiextensions.k8s.io".into(),
                version: "v1".into(),
                kind: "CustomResourceDefinition".into(),
                name: "widgets.example.com".into(),
                namespace: String::new(),
            }])
        });
        controller.expect_delete().times(0);
        let service = MigrationService::new(
            db.clone(),
            Bus::new(),
            Some(Arc::new(controller)),
            Arc::new(MockReleaseApi::new()),
            None,
            true,
            None,
        );
        assert!(service
            .migrate_deployment_type(&request(env, DeploymentMode::DirectRelease))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_trigger_reports_not_yet_deleted() {
        let db = crate::db::test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        seed_installed(
            &db,
            env,
            "nginx",
            DeploymentMode::GitOps,
            DeploymentStatus::DeployInit,
        )
        .await;

        // the old release still resolves, so the trigger must wait
        let mut release = MockReleaseApi::new();
        release
            .expect_get_detail()
            .returning(|_, _, _| Ok(serde_json::json!({"info": {"status": "deployed"}})));
        let service = MigrationService::new(
            db.clone(),
            Bus::new(),
            Some(Arc::new(MockControllerApi::new())),
            Arc::new(release),
            None,
            true,
            None,
        );
        let response = service
            .trigger_after_migration(&request(env, DeploymentMode::GitOps))
            .await
            .unwrap();
        assert!(response.successful_pipelines.is_empty());
        assert_eq!(response.failed_pipelines.len(), 1);
        assert_eq!(response.failed_pipelines[0].error, APP_NOT_DELETED_YET);
        assert_eq!(
            response.failed_pipelines[0].status,
            MigrationStatus::NotYetDeleted
        );
    }

    #[tokio::test]
    async fn test_trigger_publishes_for_confirmed_deletions() {
        let db = crate::db::test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        let installed = seed_installed(
            &db,
            env,
            "nginx",
            DeploymentMode::DirectRelease,
            DeploymentStatus::DeployInit,
        )
        .await;
        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        db.upsert_app_status(detail.app_id(), env, "Healthy")
            .await
            .unwrap();

        // old controller app is gone
        let mut controller = MockControllerApi::new();
        controller
            .expect_get()
            .returning(|name, _| Err(CdError::NotFound(name.to_string())));
        let bus = Bus::new();
        let rx = bus.subscribe(BULK_DEPLOY_TOPIC);
        let service = MigrationService::new(
            db.clone(),
            bus,
            Some(Arc::new(controller)),
            Arc::new(MockReleaseApi::new()),
            None,
            true,
            None,
        );
        let response = service
            .trigger_after_migration(&request(env, DeploymentMode::DirectRelease))
            .await
            .unwrap();
        assert_eq!(response.successful_pipelines.len(), 1);
        assert_eq!(
            response.successful_pipelines[0].status,
            MigrationStatus::Success
        );

        // one deploy message went out and the cached status row is gone
        let raw = rx.try_recv().unwrap();
        let payload: DeployPayload = serde_json::from_str(&raw).unwrap();
        assert!(payload.installed_app_version_id > 0);
        assert!(db
            .get_app_status(detail.app_id(), env)
            .await
            .unwrap()
            .is_none());

        let after = db.get_installed_app(installed).await.unwrap().unwrap();
        assert_eq!(after.installed_app.status, DeploymentStatus::Enqueued);
    }
}
