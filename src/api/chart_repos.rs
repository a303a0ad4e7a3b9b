use axum::{
    extract::{Path, State},
    Json,
};

use super::response::ApiResponse;
use super::AppState;
use crate::error::AppError;
use crate::service::chart_repo::{ChartRepoDto, OciRegistryDto};

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<ChartRepoDto>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let id = state.chart_repos.create(&request).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "id": id })))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ChartRepoDto>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    state.chart_repos.update(id, &request).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "id": id })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    state.chart_repos.delete(id).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "deleted": true })))
}

pub async fn upsert_oci_registry(
    State(state): State<AppState>,
    Json(request): Json<OciRegistryDto>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    state.chart_repos.upsert_oci_registry(&request).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "synced": true })))
}

pub async fn delete_oci_registry(
    State(state): State<AppState>,
    Json(request): Json<OciRegistryDto>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    state.chart_repos.delete_oci_registry(&request).await?;
    Ok(ApiResponse::ok(serde_json::json!({ "deleted": true })))
}
