//! Chart repository registration: the catalog row plus the credential
//! projection into the CD controller, when GitOps is configured.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::k8s::{ChartRepoAddRequest, ChartRepoUpdateRequest, RepositoryCreds};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartRepoDto {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub allow_insecure_connection: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_oci: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciRegistryDto {
    pub registry_url: String,
    pub repo: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub is_public: bool,
    pub registry_id: i64,
}

pub struct ChartRepoService {
    db: Database,
    creds: Option<RepositoryCreds>,
}

impl ChartRepoService {
    pub fn new(db: Database, creds: Option<RepositoryCreds>) -> Self {
        Self { db, creds }
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, request: &ChartRepoDto) -> AppResult<i64> {
        if request.name.trim().is_empty() || request.url.trim().is_empty() {
            return Err(AppError::BadRequest("name and url are required".into()));
        }
        let id = self
            .db
            .create_chart_repo(&request.name, &request.url, request.is_oci)
            .await?;
        if let Some(creds) = &self.creds {
            creds
                .add_chart_repo(&ChartRepoAddRequest {
                    name: request.name.clone(),
                    url: request.url.clone(),
                    username: request.username.clone(),
                    password: request.password.clone(),
                    allow_insecure_connection: request.allow_insecure_connection,
                    is_private: request.is_private,
                })
                .await?;
        }
        info!(id, "chart repository created");
        Ok(id)
    }

    #[instrument(skip(self, request), fields(id))]
    pub async fn update(&self, id: i64, request: &ChartRepoDto) -> AppResult<()> {
        let existing = self
            .db
            .get_chart_repo(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chart repo {id} not found")))?;
        self.db
            .update_chart_repo_row(id, &request.name, &request.url, true)
            .await?;
        if let Some(creds) = &self.creds {
            creds
                .update_chart_repo(&ChartRepoUpdateRequest {
                    name: request.name.clone(),
                    previous_name: existing.name,
                    url: request.url.clone(),
                    previous_url: existing.url,
                    username: request.username.clone(),
                    password: request.password.clone(),
                    allow_insecure_connection: request.allow_insecure_connection,
                    is_private: request.is_private,
                })
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> AppResult<()> {
        let existing = self
            .db
            .get_chart_repo(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chart repo {id} not found")))?;
        self.db.mark_chart_repo_deleted(id).await?;
        if let Some(creds) = &self.creds {
            creds.delete_chart_repo(&existing.name, &existing.url).await?;
        }
        info!(id, "chart repository deleted");
        Ok(())
    }

    #[instrument(skip(self, request), fields(registry = %request.registry_url))]
    pub async fn upsert_oci_registry(&self, request: &OciRegistryDto) -> AppResult<()> {
        let creds = self
            .creds
            .as_ref()
            .ok_or_else(|| AppError::internal("gitops is not configured"))?;
        creds
            .add_or_update_oci_registry(
                &request.registry_url,
                &request.repo,
                &request.username,
                &request.password,
                request.is_public,
                request.registry_id,
            )
            .await
    }

    #[instrument(skip(self, request), fields(registry = %request.registry_url))]
    pub async fn delete_oci_registry(&self, request: &OciRegistryDto) -> AppResult<()> {
        let creds = self
            .creds
            .as_ref()
            .ok_or_else(|| AppError::internal("gitops is not configured"))?;
        creds
            .delete_oci_registry(&request.registry_url, &request.repo, request.registry_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_without_gitops_writes_row_only() {
        let db = crate::db::test_database().await;
        let service = ChartRepoService::new(db.clone(), None);
        let id = service
            .create(&ChartRepoDto {
                id: None,
                name: "bitnami".into(),
                url: "https://charts.bitnami.com/bitnami".into(),
                username: String::new(),
                password: String::new(),
                allow_insecure_connection: false,
                is_private: false,
                is_oci: false,
            })
            .await
            .unwrap();
        let row = db.get_chart_repo(id).await.unwrap().unwrap();
        assert_eq!(row.name, "bitnami");
        assert_eq!(row.active, 1);

        service.delete(id).await.unwrap();
        assert!(db.get_chart_repo(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oci_requires_gitops() {
        let db = crate::db::test_database().await;
        let service = ChartRepoService::new(db, None);
        let err = service
            .upsert_oci_registry(&OciRegistryDto {
                registry_url: "docker.io/bitnamicharts".into(),
                repo: "bitnami".into(),
                username: String::new(),
                password: String::new(),
                is_public: true,
                registry_id: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
