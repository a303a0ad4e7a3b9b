use sqlx::FromRow;

use super::Database;
use crate::error::AppResult;

#[derive(Debug, Clone, FromRow)]
pub struct ChartRepoRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub is_oci: i64,
    pub active: i64,
}

impl Database {
    pub async fn create_chart_repo(
        &self,
        name: &str,
        repo_url: &str,
        is_oci: bool,
    ) -> AppResult<i64> {
        let result = sqlx::query("INSERT INTO chart_repo (name, url, is_oci) VALUES (?, ?, ?)")
            .bind(name)
            .bind(repo_url)
            .bind(is_oci as i64)
            .execute(self.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_chart_repo(&self, id: i64) -> AppResult<Option<ChartRepoRow>> {
        Ok(sqlx::query_as(
            "SELECT id, name, url, is_oci, active FROM chart_repo WHERE id = ? AND deleted = 0",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn update_chart_repo_row(
        &self,
        id: i64,
        name: &str,
        repo_url: &str,
        active: bool,
    ) -> AppResult<()> {
        sqlx::query("UPDATE chart_repo SET name = ?, url = ?, active = ? WHERE id = ?")
            .bind(name)
            .bind(repo_url)
            .bind(active as i64)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_chart_repo_deleted(&self, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE chart_repo SET deleted = 1, active = 0 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Latest known version of a chart by its catalog name. Used by the
    /// default cluster-component install.
    pub async fn find_chart_version_by_name(
        &self,
        app_store_name: &str,
    ) -> AppResult<Option<super::ChartVersionRef>> {
        Ok(sqlx::query_as(
            "SELECT asav.id, asav.app_store_name, asav.version, asav.chart_repo_id, \
                    cr.name AS chart_repo_name, cr.url AS chart_repo_url, cr.active AS repo_active, asav.deprecated \
             FROM app_store_application_version asav \
             JOIN chart_repo cr ON cr.id = asav.chart_repo_id \
             WHERE asav.app_store_name = ? AND cr.active = 1 \
             ORDER BY asav.id DESC LIMIT 1",
        )
        .bind(app_store_name)
        .fetch_optional(self.pool())
        .await?)
    }
}
