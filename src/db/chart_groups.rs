use chrono::Utc;
use sqlx::{FromRow, Transaction};

use super::Database;
use crate::error::AppResult;

/// Membership of an installed app in a bulk install batch.
#[derive(Debug, Clone, FromRow)]
pub struct ChartGroupDeploymentRow {
    pub id: i64,
    pub chart_group_id: i64,
    pub chart_group_entry_id: Option<i64>,
    pub installed_app_id: i64,
    pub group_installation_id: String,
    pub deleted: i64,
}

impl Database {
    pub async fn save_chart_group_deployment(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        chart_group_id: i64,
        chart_group_entry_id: Option<i64>,
        installed_app_id: i64,
        group_installation_id: &str,
    ) -> AppResult<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO chart_group_deployment \
             (chart_group_id, chart_group_entry_id, installed_app_id, group_installation_id, created_on, updated_on) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(chart_group_id)
        .bind(chart_group_entry_id)
        .bind(installed_app_id)
        .bind(group_installation_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_chart_group_deployment(
        &self,
        installed_app_id: i64,
    ) -> AppResult<Option<ChartGroupDeploymentRow>> {
        Ok(sqlx::query_as(
            "SELECT id, chart_group_id, chart_group_entry_id, installed_app_id, group_installation_id, deleted \
             FROM chart_group_deployment WHERE installed_app_id = ? AND deleted = 0",
        )
        .bind(installed_app_id)
        .fetch_optional(self.pool())
        .await?)
    }

    /// Soft-delete the batch membership when the installation is removed.
    pub async fn mark_chart_group_deployment_deleted(
        &self,
        tx: &mut Transaction<'static, sqlx::Sqlite>,
        installed_app_id: i64,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE chart_group_deployment SET deleted = 1, updated_on = ? WHERE installed_app_id = ?",
        )
        .bind(&now)
        .bind(installed_app_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
