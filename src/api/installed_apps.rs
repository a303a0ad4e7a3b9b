use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use super::response::ApiResponse;
use super::{parse_id_list, request_ctx, AppState};
use crate::db::InstalledAppListItem;
use crate::error::AppError;
use crate::models::{
    AppExistsEntry, AppExistsRequest, InstallAppRequest, InstalledAppFilter, StatusTimeline,
    UpdateAppRequest,
};
use crate::service::install::{InstalledAppDetailDto, InstalledAppDto};

/// Create a single installation.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InstallAppRequest>,
) -> Result<ApiResponse<InstalledAppDto>, AppError> {
    let ctx = request_ctx(&headers);
    let dto = state.install.install(&ctx, &request).await?;
    Ok(ApiResponse::ok(dto))
}

/// Promote a new version of an installation.
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateAppRequest>,
) -> Result<ApiResponse<InstalledAppDto>, AppError> {
    let ctx = request_ctx(&headers);
    let dto = state.install.update(&ctx, &request).await?;
    Ok(ApiResponse::ok(dto))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    env_ids: Option<String>,
    cluster_ids: Option<String>,
    chart_repo_ids: Option<String>,
    app_statuses: Option<String>,
    #[serde(default)]
    only_deprecated: bool,
    app_store_name: Option<String>,
    app_name: Option<String>,
    #[serde(default)]
    offset: i64,
    size: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse<Vec<InstalledAppListItem>>, AppError> {
    let filter = InstalledAppFilter {
        env_ids: parse_id_list(&query.env_ids),
        cluster_ids: parse_id_list(&query.cluster_ids),
        chart_repo_ids: parse_id_list(&query.chart_repo_ids),
        app_statuses: query
            .app_statuses
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect(),
        only_deprecated: query.only_deprecated,
        app_store_name: query.app_store_name,
        app_name: query.app_name,
        offset: query.offset,
        size: query.size.unwrap_or(20),
    };
    let items = state.install.list(&filter).await?;
    Ok(ApiResponse::ok(items))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(installed_app_id): Path<i64>,
) -> Result<ApiResponse<InstalledAppDetailDto>, AppError> {
    let dto = state.install.get_detail(installed_app_id).await?;
    Ok(ApiResponse::ok(dto))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(installed_app_id): Path<i64>,
    Query(query): Query<DeleteQuery>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let ctx = request_ctx(&headers);
    state
        .install
        .delete(&ctx, installed_app_id, query.force)
        .await?;
    Ok(ApiResponse::ok(serde_json::json!({ "deleted": true })))
}

pub async fn delete_non_cascade(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(installed_app_id): Path<i64>,
) -> Result<ApiResponse<serde_json::Value>, AppError> {
    let ctx = request_ctx(&headers);
    state
        .install
        .delete_non_cascade(&ctx, installed_app_id)
        .await?;
    Ok(ApiResponse::ok(serde_json::json!({ "deleted": true })))
}

/// Bulk existence check for application names.
pub async fn exists(
    State(state): State<AppState>,
    Json(request): Json<AppExistsRequest>,
) -> Result<ApiResponse<Vec<AppExistsEntry>>, AppError> {
    let entries = state.install.exists(&request.names).await?;
    Ok(ApiResponse::ok(entries))
}

/// Status timeline of the latest deployment attempt.
pub async fn timeline(
    State(state): State<AppState>,
    Path((installed_app_id, env_id)): Path<(i64, i64)>,
) -> Result<ApiResponse<Vec<StatusTimeline>>, AppError> {
    let entries = state
        .install
        .deployment_timeline(installed_app_id, env_id)
        .await?;
    Ok(ApiResponse::ok(entries))
}
