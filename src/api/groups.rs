use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};

use super::response::ApiResponse;
use super::{request_ctx, AppState};
use crate::error::AppError;
use crate::models::ChartGroupInstallRequest;
use crate::service::bulk::ChartGroupInstallAppRes;

/// Bulk group install.
pub async fn install(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChartGroupInstallRequest>,
) -> Result<ApiResponse<ChartGroupInstallAppRes>, AppError> {
    let ctx = request_ctx(&headers);
    let res = state.bulk.deploy_bulk(&ctx, &request).await?;
    Ok(ApiResponse::ok(res))
}

/// Install the default component charts into a cluster.
pub async fn install_cluster_components(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(cluster_id): Path<i64>,
) -> Result<ApiResponse<Vec<String>>, AppError> {
    let ctx = request_ctx(&headers);
    let triggered = state
        .install
        .install_cluster_components(&ctx, cluster_id)
        .await?;
    Ok(ApiResponse::ok(triggered))
}
