use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};

use super::Database;
use crate::error::{AppError, AppResult};
use crate::models::{
    AppType, DeploymentMode, DeploymentStatus, InstalledApp, InstalledAppDetail,
    InstalledAppFilter, InstalledAppVersion, OfferingMode,
};

/// Input for creating an installed app row.
#[derive(Debug, Clone)]
pub struct NewInstalledApp {
    pub app_id: i64,
    pub environment_id: i64,
    pub deployment_mode: DeploymentMode,
    pub git_ops_repo_url: String,
    pub is_custom_repo: bool,
    pub status: DeploymentStatus,
}

/// Input for promoting a version.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub chart_version_id: i64,
    pub values_yaml: String,
    pub reference_value_id: Option<i64>,
    pub reference_value_kind: Option<String>,
}

/// Target environment, referenced but not owned.
#[derive(Debug, Clone, FromRow)]
pub struct Environment {
    pub id: i64,
    pub environment_name: String,
    pub cluster_id: i64,
    pub namespace: String,
    pub is_default: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Cluster {
    pub id: i64,
    pub cluster_name: String,
    pub server_url: String,
    pub error_in_connecting: String,
}

impl Cluster {
    pub fn is_reachable(&self) -> bool {
        self.error_in_connecting.is_empty()
    }
}

/// A chart version joined with its repository, referenced but not owned.
#[derive(Debug, Clone, FromRow)]
pub struct ChartVersionRef {
    pub id: i64,
    pub app_store_name: String,
    pub version: String,
    pub chart_repo_id: i64,
    pub chart_repo_name: String,
    pub chart_repo_url: String,
    pub repo_active: i64,
    pub deprecated: i64,
}

impl ChartVersionRef {
    /// `repo/chart` reference handed to the release client.
    pub fn chart_reference(&self) -> String {
        format!("{}/{}", self.chart_repo_name, self.app_store_name)
    }
}

/// Row shape of the list endpoint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAppListItem {
    pub installed_app_id: i64,
    pub app_name: String,
    pub environment_id: i64,
    pub environment_name: String,
    pub chart_name: String,
    pub chart_version: String,
    pub deployment_mode: DeploymentMode,
    pub status: DeploymentStatus,
    pub deprecated: bool,
}

#[derive(FromRow)]
struct InstalledAppRow {
    id: i64,
    app_id: i64,
    environment_id: i64,
    deployment_app_type: String,
    git_ops_repo_url: String,
    is_custom_repository: i64,
    status: String,
    deployment_app_delete_request: i64,
    notes: String,
    active: i64,
    created_on: String,
    updated_on: String,
}

#[derive(FromRow)]
struct InstalledAppDetailRow {
    id: i64,
    app_id: i64,
    environment_id: i64,
    deployment_app_type: String,
    git_ops_repo_url: String,
    is_custom_repository: i64,
    status: String,
    deployment_app_delete_request: i64,
    notes: String,
    active: i64,
    created_on: String,
    updated_on: String,
    app_name: String,
    app_type: String,
    app_offering_mode: String,
    environment_name: String,
    namespace: String,
    cluster_id: i64,
}

#[derive(FromRow)]
struct VersionRow {
    id: i64,
    installed_app_id: i64,
    app_store_application_version_id: i64,
    values_yaml: String,
    reference_value_id: Option<i64>,
    reference_value_kind: Option<String>,
    active: i64,
    created_on: String,
    updated_on: String,
}

#[derive(FromRow)]
struct ListRow {
    installed_app_id: i64,
    app_name: String,
    environment_id: i64,
    environment_name: String,
    chart_name: String,
    chart_version: String,
    deployment_app_type: String,
    status: String,
    deprecated: i64,
}

// Dual-read of the repo URL: rows written before the url column existed keep
// the repo name populated instead.
const INSTALLED_APP_COLS: &str = "id, app_id, environment_id, deployment_app_type, \
     CASE WHEN git_ops_repo_url <> '' THEN git_ops_repo_url ELSE git_ops_repo_name END AS git_ops_repo_url, \
     is_custom_repository, status, deployment_app_delete_request, notes, active, created_on, updated_on";

impl Database {
    /// Create an installed app and return its id. Fails when another active
    /// binding exists for the same `(app, environment)` pair.
    pub async fn create_installed_app(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        new: &NewInstalledApp,
    ) -> AppResult<i64> {
        if new.deployment_mode == DeploymentMode::GitOps && new.git_ops_repo_url.is_empty() {
            return Err(AppError::BadRequest(
                "gitops deployment requires a repository url".to_string(),
            ));
        }
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM installed_app WHERE app_id = ? AND environment_id = ? AND active = 1",
        )
        .bind(new.app_id)
        .bind(new.environment_id)
        .fetch_optional(&mut **tx)
        .await?;
        if existing.is_some() {
            return Err(AppError::Conflict(format!(
                "an active installation already exists for app {} in environment {}",
                new.app_id, new.environment_id
            )));
        }
        if !new.git_ops_repo_url.is_empty() {
            let shared: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM installed_app WHERE git_ops_repo_url = ? AND active = 1",
            )
            .bind(&new.git_ops_repo_url)
            .fetch_optional(&mut **tx)
            .await?;
            if shared.is_some() {
                return Err(AppError::BadRequest(format!(
                    "gitops repository {} is already used by another installation",
                    new.git_ops_repo_url
                )));
            }
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO installed_app \
             (app_id, environment_id, deployment_app_type, git_ops_repo_url, is_custom_repository, status, created_on, updated_on) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.app_id)
        .bind(new.environment_id)
        .bind(new.deployment_mode.to_string())
        .bind(&new.git_ops_repo_url)
        .bind(new.is_custom_repo as i64)
        .bind(new.status.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Atomically deactivate the prior version and insert the new one.
    pub async fn promote_version(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_id: i64,
        new: &NewVersion,
    ) -> AppResult<i64> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE installed_app_versions SET active = 0, updated_on = ? WHERE installed_app_id = ? AND active = 1",
        )
        .bind(&now)
        .bind(installed_app_id)
        .execute(&mut **tx)
        .await?;

        let result = sqlx::query(
            "INSERT INTO installed_app_versions \
             (installed_app_id, app_store_application_version_id, values_yaml, reference_value_id, reference_value_kind, active, created_on, updated_on) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(installed_app_id)
        .bind(new.chart_version_id)
        .bind(&new.values_yaml)
        .bind(new.reference_value_id)
        .bind(&new.reference_value_kind)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_installed_app(&self, id: i64) -> AppResult<Option<InstalledAppDetail>> {
        let row: Option<InstalledAppDetailRow> = sqlx::query_as(
            "SELECT ia.id, ia.app_id, ia.environment_id, ia.deployment_app_type, \
                    CASE WHEN ia.git_ops_repo_url <> '' THEN ia.git_ops_repo_url ELSE ia.git_ops_repo_name END AS git_ops_repo_url, \
                    ia.is_custom_repository, ia.status, ia.deployment_app_delete_request, ia.notes, ia.active, ia.created_on, ia.updated_on, \
                    a.app_name, a.app_type, a.app_offering_mode, \
                    e.environment_name, e.namespace, e.cluster_id \
             FROM installed_app ia \
             JOIN app a ON a.id = ia.app_id \
             JOIN environment e ON e.id = ia.environment_id \
             WHERE ia.id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_detail).transpose()
    }

    pub async fn find_active_installed_app(
        &self,
        app_id: i64,
        environment_id: i64,
    ) -> AppResult<Option<InstalledApp>> {
        let row: Option<InstalledAppRow> = sqlx::query_as(&format!(
            "SELECT {INSTALLED_APP_COLS} FROM installed_app WHERE app_id = ? AND environment_id = ? AND active = 1",
        ))
        .bind(app_id)
        .bind(environment_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_installed_app).transpose()
    }

    /// Active installations of an environment in the given delivery mode,
    /// optionally restricted or trimmed by installed-app id.
    pub async fn active_by_env_and_mode(
        &self,
        environment_id: i64,
        mode: DeploymentMode,
        include_apps: &[i64],
        exclude_apps: &[i64],
    ) -> AppResult<Vec<InstalledAppDetail>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ia.id, ia.app_id, ia.environment_id, ia.deployment_app_type, \
                    CASE WHEN ia.git_ops_repo_url <> '' THEN ia.git_ops_repo_url ELSE ia.git_ops_repo_name END AS git_ops_repo_url, \
                    ia.is_custom_repository, ia.status, ia.deployment_app_delete_request, ia.notes, ia.active, ia.created_on, ia.updated_on, \
                    a.app_name, a.app_type, a.app_offering_mode, \
                    e.environment_name, e.namespace, e.cluster_id \
             FROM installed_app ia \
             JOIN app a ON a.id = ia.app_id \
             JOIN environment e ON e.id = ia.environment_id \
             WHERE ia.active = 1 AND ia.environment_id = ",
        );
        qb.push_bind(environment_id);
        qb.push(" AND ia.deployment_app_type = ");
        qb.push_bind(mode.to_string());
        if !include_apps.is_empty() {
            qb.push(" AND ia.id IN (");
            let mut sep = qb.separated(", ");
            for id in include_apps {
                sep.push_bind(*id);
            }
            qb.push(")");
        }
        if !exclude_apps.is_empty() {
            qb.push(" AND ia.id NOT IN (");
            let mut sep = qb.separated(", ");
            for id in exclude_apps {
                sep.push_bind(*id);
            }
            qb.push(")");
        }

        let rows: Vec<InstalledAppDetailRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        rows.into_iter().map(row_to_detail).collect()
    }

    pub async fn list_installed_apps(
        &self,
        filter: &InstalledAppFilter,
    ) -> AppResult<Vec<InstalledAppListItem>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ia.id AS installed_app_id, a.app_name, ia.environment_id, e.environment_name, \
                    asav.app_store_name AS chart_name, asav.version AS chart_version, \
                    ia.deployment_app_type, ia.status, asav.deprecated \
             FROM installed_app ia \
             JOIN app a ON a.id = ia.app_id \
             JOIN environment e ON e.id = ia.environment_id \
             JOIN installed_app_versions iav ON iav.installed_app_id = ia.id AND iav.active = 1 \
             JOIN app_store_application_version asav ON asav.id = iav.app_store_application_version_id \
             WHERE ia.active = 1",
        );
        if !filter.env_ids.is_empty() {
            qb.push(" AND ia.environment_id IN (");
            let mut sep = qb.separated(", ");
            for id in &filter.env_ids {
                sep.push_bind(*id);
            }
            qb.push(")");
        }
        if !filter.cluster_ids.is_empty() {
            qb.push(" AND e.cluster_id IN (");
            let mut sep = qb.separated(", ");
            for id in &filter.cluster_ids {
                sep.push_bind(*id);
            }
            qb.push(")");
        }
        if !filter.chart_repo_ids.is_empty() {
            qb.push(" AND asav.chart_repo_id IN (");
            let mut sep = qb.separated(", ");
            for id in &filter.chart_repo_ids {
                sep.push_bind(*id);
            }
            qb.push(")");
        }
        if !filter.app_statuses.is_empty() {
            qb.push(" AND ia.status IN (");
            let mut sep = qb.separated(", ");
            for s in &filter.app_statuses {
                sep.push_bind(s.to_string());
            }
            qb.push(")");
        }
        if filter.only_deprecated {
            qb.push(" AND asav.deprecated = 1");
        }
        if let Some(name) = &filter.app_store_name {
            qb.push(" AND asav.app_store_name = ");
            qb.push_bind(name.clone());
        }
        if let Some(name) = &filter.app_name {
            qb.push(" AND a.app_name LIKE ");
            qb.push_bind(format!("%{}%", name));
        }
        qb.push(" ORDER BY ia.id LIMIT ");
        qb.push_bind(filter.size.max(1));
        qb.push(" OFFSET ");
        qb.push_bind(filter.offset.max(0));

        let rows: Vec<ListRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows
            .into_iter()
            .map(|r| InstalledAppListItem {
                installed_app_id: r.installed_app_id,
                app_name: r.app_name,
                environment_id: r.environment_id,
                environment_name: r.environment_name,
                chart_name: r.chart_name,
                chart_version: r.chart_version,
                deployment_mode: r
                    .deployment_app_type
                    .parse()
                    .unwrap_or(DeploymentMode::DirectRelease),
                status: DeploymentStatus::from(r.status),
                deprecated: r.deprecated != 0,
            })
            .collect())
    }

    pub async fn update_installed_app_status(
        &self,
        installed_app_id: i64,
        status: DeploymentStatus,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE installed_app SET status = ?, updated_on = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(&now)
            .bind(installed_app_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Transaction-scoped variant of
    /// [`Database::update_installed_app_status`].
    pub async fn update_installed_app_status_tx(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_id: i64,
        status: DeploymentStatus,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE installed_app SET status = ?, updated_on = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(&now)
            .bind(installed_app_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Flag an installation for deletion. With `force` the row is
    /// deactivated immediately instead of waiting for the delete path.
    pub async fn mark_for_delete(&self, installed_app_id: i64, force: bool) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        if force {
            sqlx::query(
                "UPDATE installed_app SET deployment_app_delete_request = 1, active = 0, updated_on = ? WHERE id = ?",
            )
            .bind(&now)
            .bind(installed_app_id)
            .execute(self.pool())
            .await?;
        } else {
            sqlx::query(
                "UPDATE installed_app SET deployment_app_delete_request = 1, updated_on = ? WHERE id = ?",
            )
            .bind(&now)
            .bind(installed_app_id)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    /// Cascade soft-delete: installation plus its versions.
    pub async fn soft_delete_installed_app(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_id: i64,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE installed_app SET active = 0, updated_on = ? WHERE id = ?")
            .bind(&now)
            .bind(installed_app_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query(
            "UPDATE installed_app_versions SET active = 0, updated_on = ? WHERE installed_app_id = ?",
        )
        .bind(&now)
        .bind(installed_app_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn active_version(
        &self,
        installed_app_id: i64,
    ) -> AppResult<Option<InstalledAppVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(
            "SELECT id, installed_app_id, app_store_application_version_id, values_yaml, \
                    reference_value_id, reference_value_kind, active, created_on, updated_on \
             FROM installed_app_versions WHERE installed_app_id = ? AND active = 1",
        )
        .bind(installed_app_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_version).transpose()
    }

    pub async fn get_version(&self, version_id: i64) -> AppResult<Option<InstalledAppVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(
            "SELECT id, installed_app_id, app_store_application_version_id, values_yaml, \
                    reference_value_id, reference_value_kind, active, created_on, updated_on \
             FROM installed_app_versions WHERE id = ?",
        )
        .bind(version_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(row_to_version).transpose()
    }

    /// Refresh the "last deployed" timestamp shown for direct releases.
    pub async fn touch_version(&self, version_id: i64) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE installed_app_versions SET updated_on = ? WHERE id = ?")
            .bind(&now)
            .bind(version_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Retarget delivery mode for the given installations. The status is set
    /// alongside, in the same statement.
    pub async fn update_deployment_mode_for(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_ids: &[i64],
        mode: DeploymentMode,
        status: DeploymentStatus,
    ) -> AppResult<()> {
        if installed_app_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE installed_app SET deployment_app_type = ");
        qb.push_bind(mode.to_string());
        qb.push(", status = ");
        qb.push_bind(status.to_string());
        qb.push(", updated_on = ");
        qb.push_bind(now);
        qb.push(" WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in installed_app_ids {
            sep.push_bind(*id);
        }
        qb.push(")");
        qb.build().execute(&mut **tx).await?;
        Ok(())
    }

    /// Assign the derived repository URL to installations entering GitOps
    /// mode without one.
    pub async fn set_gitops_repo_url(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_id: i64,
        repo_url: &str,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE installed_app SET git_ops_repo_url = ?, updated_on = ? WHERE id = ?")
            .bind(repo_url)
            .bind(&now)
            .bind(installed_app_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Externally linked apps migrated to GitOps become full-mode offerings.
    pub async fn update_offering_mode_full(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        app_ids: &[i64],
    ) -> AppResult<()> {
        if app_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE app SET app_offering_mode = 'FULL', updated_on = ");
        qb.push_bind(now);
        qb.push(" WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in app_ids {
            sep.push_bind(*id);
        }
        qb.push(")");
        qb.build().execute(&mut **tx).await?;
        Ok(())
    }

    /// Find an active application by name or create it.
    pub async fn find_or_create_app(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        app_name: &str,
        team_id: i64,
        app_type: AppType,
    ) -> AppResult<i64> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM app WHERE app_name = ? AND active = 1")
                .bind(app_name)
                .fetch_optional(&mut **tx)
                .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO app (app_name, app_type, app_offering_mode, team_id, created_on, updated_on) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(app_name)
        .bind(app_type.to_string())
        .bind(OfferingMode::Full.to_string())
        .bind(team_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Names in `names` that currently have an active application row.
    pub async fn existing_app_names(&self, names: &[String]) -> AppResult<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT app_name FROM app WHERE active = 1 AND app_name IN (");
        let mut sep = qb.separated(", ");
        for name in names {
            sep.push_bind(name.clone());
        }
        qb.push(")");
        let rows: Vec<(String,)> = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub async fn get_environment(&self, id: i64) -> AppResult<Option<Environment>> {
        Ok(sqlx::query_as(
            "SELECT id, environment_name, cluster_id, namespace, is_default FROM environment WHERE id = ? AND active = 1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn default_environment_for_cluster(
        &self,
        cluster_id: i64,
    ) -> AppResult<Option<Environment>> {
        Ok(sqlx::query_as(
            "SELECT id, environment_name, cluster_id, namespace, is_default FROM environment \
             WHERE cluster_id = ? AND is_default = 1 AND active = 1",
        )
        .bind(cluster_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn get_cluster(&self, id: i64) -> AppResult<Option<Cluster>> {
        Ok(sqlx::query_as(
            "SELECT id, cluster_name, server_url, error_in_connecting FROM cluster WHERE id = ? AND active = 1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn get_chart_version(&self, id: i64) -> AppResult<Option<ChartVersionRef>> {
        Ok(sqlx::query_as(
            "SELECT asav.id, asav.app_store_name, asav.version, asav.chart_repo_id, \
                    cr.name AS chart_repo_name, cr.url AS chart_repo_url, cr.active AS repo_active, asav.deprecated \
             FROM app_store_application_version asav \
             JOIN chart_repo cr ON cr.id = asav.chart_repo_id \
             WHERE asav.id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?)
    }

    // ==================== status cache ====================

    pub async fn get_app_status(&self, app_id: i64, env_id: i64) -> AppResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM app_status WHERE app_id = ? AND env_id = ?")
                .bind(app_id)
                .bind(env_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(s,)| s))
    }

    pub async fn upsert_app_status(&self, app_id: i64, env_id: i64, status: &str) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO app_status (app_id, env_id, status, updated_on) VALUES (?, ?, ?, ?) \
             ON CONFLICT (app_id, env_id) DO UPDATE SET status = excluded.status, updated_on = excluded.updated_on",
        )
        .bind(app_id)
        .bind(env_id)
        .bind(status)
        .bind(&now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Missing rows are not an error; the cache may never have been written.
    pub async fn delete_app_status(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        app_id: i64,
        env_id: i64,
    ) -> AppResult<()> {
        sqlx::query("DELETE FROM app_status WHERE app_id = ? AND env_id = ?")
            .bind(app_id)
            .bind(env_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ==================== cluster components ====================

    pub async fn record_cluster_component(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        cluster_id: i64,
        installed_app_id: i64,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO cluster_installed_app (cluster_id, installed_app_id, created_on) VALUES (?, ?, ?)",
        )
        .bind(cluster_id)
        .bind(installed_app_id)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn cluster_component_app_names(&self, cluster_id: i64) -> AppResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT a.app_name FROM cluster_installed_app cia \
             JOIN installed_app ia ON ia.id = cia.installed_app_id \
             JOIN app a ON a.id = ia.app_id \
             WHERE cia.cluster_id = ? AND ia.active = 1",
        )
        .bind(cluster_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }
}

fn parse_time(value: &str) -> AppResult<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|e| AppError::internal(format!("bad timestamp in db: {e}")))
}

fn row_to_installed_app(row: InstalledAppRow) -> AppResult<InstalledApp> {
    Ok(InstalledApp {
        id: row.id,
        app_id: row.app_id,
        environment_id: row.environment_id,
        deployment_mode: row
            .deployment_app_type
            .parse()
            .unwrap_or(DeploymentMode::DirectRelease),
        git_ops_repo_url: row.git_ops_repo_url,
        is_custom_repo: row.is_custom_repository != 0,
        status: DeploymentStatus::from(row.status),
        delete_requested: row.deployment_app_delete_request != 0,
        notes: row.notes,
        active: row.active != 0,
        created_at: parse_time(&row.created_on)?,
        updated_at: parse_time(&row.updated_on)?,
    })
}

fn row_to_detail(row: InstalledAppDetailRow) -> AppResult<InstalledAppDetail> {
    let installed_app = row_to_installed_app(InstalledAppRow {
        id: row.id,
        app_id: row.app_id,
        environment_id: row.environment_id,
        deployment_app_type: row.deployment_app_type,
        git_ops_repo_url: row.git_ops_repo_url,
        is_custom_repository: row.is_custom_repository,
        status: row.status,
        deployment_app_delete_request: row.deployment_app_delete_request,
        notes: row.notes,
        active: row.active,
        created_on: row.created_on,
        updated_on: row.updated_on,
    })?;
    Ok(InstalledAppDetail {
        installed_app,
        app_name: row.app_name,
        app_type: row.app_type.parse().unwrap_or(AppType::ChartStore),
        offering_mode: row
            .app_offering_mode
            .parse()
            .unwrap_or(OfferingMode::Full),
        environment_name: row.environment_name,
        namespace: row.namespace,
        cluster_id: row.cluster_id,
    })
}

fn row_to_version(row: VersionRow) -> AppResult<InstalledAppVersion> {
    Ok(InstalledAppVersion {
        id: row.id,
        installed_app_id: row.installed_app_id,
        chart_version_id: row.app_store_application_version_id,
        values_yaml: row.values_yaml,
        reference_value_id: row.reference_value_id,
        reference_value_kind: row.reference_value_kind,
        active: row.active != 0,
        created_at: parse_time(&row.created_on)?,
        updated_at: parse_time(&row.updated_on)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::test_database;
    use super::*;

    pub(crate) async fn seed_env(db: &Database) -> (i64, i64) {
        let cluster = sqlx::query(
            "INSERT INTO cluster (cluster_name, server_url, error_in_connecting) VALUES ('c1', 'https://k8s', '')",
        )
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid();
        let env = sqlx::query(
            "INSERT INTO environment (environment_name, cluster_id, namespace, is_default) VALUES ('dev', ?, 'apps', 1)",
        )
        .bind(cluster)
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid();
        (cluster, env)
    }

    pub(crate) async fn seed_chart(db: &Database, active: bool) -> i64 {
        let repo = sqlx::query("INSERT INTO chart_repo (name, url, active) VALUES ('bitnami', 'https://charts.bitnami.com/bitnami', ?)")
            .bind(active as i64)
            .execute(db.pool())
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query(
            "INSERT INTO app_store_application_version (app_store_name, version, chart_repo_id) VALUES ('nginx', '15.2.0', ?)",
        )
        .bind(repo)
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn test_duplicate_active_binding_rejected() {
        let db = test_database().await;
        let (_cluster, env) = seed_env(&db).await;

        let mut tx = db.begin().await.unwrap();
        let app_id = db
            .find_or_create_app(&mut tx, "redis", 1, AppType::ChartStore)
            .await
            .unwrap();
        let new = NewInstalledApp {
            app_id,
            environment_id: env,
            deployment_mode: DeploymentMode::DirectRelease,
            git_ops_repo_url: String::new(),
            is_custom_repo: false,
            status: DeploymentStatus::DeployInit,
        };
        db.create_installed_app(&mut tx, &new).await.unwrap();
        let err = db.create_installed_app(&mut tx, &new).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_gitops_requires_repo_url() {
        let db = test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        let mut tx = db.begin().await.unwrap();
        let app_id = db
            .find_or_create_app(&mut tx, "redis", 1, AppType::ChartStore)
            .await
            .unwrap();
        let err = db
            .create_installed_app(
                &mut tx,
                &NewInstalledApp {
                    app_id,
                    environment_id: env,
                    deployment_mode: DeploymentMode::GitOps,
                    git_ops_repo_url: String::new(),
                    is_custom_repo: false,
                    status: DeploymentStatus::DeployInit,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_promote_version_keeps_one_active() {
        let db = test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        let chart = seed_chart(&db, true).await;

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
                    deployment_mode: DeploymentMode::DirectRelease,
                    git_ops_repo_url: String::new(),
                    is_custom_repo: false,
                    status: DeploymentStatus::DeployInit,
                },
            )
            .await
            .unwrap();
        let v1 = db
            .promote_version(
                &mut tx,
                installed,
                &NewVersion {
                    chart_version_id: chart,
                    values_yaml: "replicaCount: 1".into(),
                    reference_value_id: None,
                    reference_value_kind: None,
                },
            )
            .await
            .unwrap();
        let v2 = db
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
        tx.commit().await.unwrap();

        assert_ne!(v1, v2);
        let active = db.active_version(installed).await.unwrap().unwrap();
        assert_eq!(active.id, v2);
        assert_eq!(active.values_yaml, "replicaCount: 2");
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM installed_app_versions WHERE installed_app_id = ? AND active = 1",
        )
        .bind(installed)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_dual_read_of_repo_name() {
        let db = test_database().await;
        let (_cluster, env) = seed_env(&db).await;
        let mut tx = db.begin().await.unwrap();
        let app_id = db
            .find_or_create_app(&mut tx, "legacy", 1, AppType::ChartStore)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        // a row written before the url column existed
        let now = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO installed_app (app_id, environment_id, deployment_app_type, git_ops_repo_name, status, created_on, updated_on) \
             VALUES (?, ?, 'gitops', 'https://git.example.com/legacy', 'SUCCESS', ?, ?)",
        )
        .bind(app_id)
        .bind(env)
        .bind(&now)
        .bind(&now)
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid();

        let detail = db.get_installed_app(id).await.unwrap().unwrap();
        assert_eq!(
            detail.installed_app.git_ops_repo_url,
            "https://git.example.com/legacy"
        );
    }

    #[tokio::test]
    async fn test_mark_for_delete_force() {
        let db = test_database().await;
        let (_c, env) = seed_env(&db).await;
        let mut tx = db.begin().await.unwrap();
        let app_id = db
            .find_or_create_app(&mut tx, "doomed", 1, AppType::ChartStore)
            .await
            .unwrap();
        let installed = db
            .create_installed_app(
                &mut tx,
                &NewInstalledApp {
                    app_id,
                    environment_id: env,
                    deployment_mode: DeploymentMode::DirectRelease,
                    git_ops_repo_url: String::new(),
                    is_custom_repo: false,
                    status: DeploymentStatus::Success,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        db.mark_for_delete(installed, true).await.unwrap();
        let detail = db.get_installed_app(installed).await.unwrap().unwrap();
        assert!(detail.installed_app.delete_requested);
        assert!(!detail.installed_app.active);
    }
}
