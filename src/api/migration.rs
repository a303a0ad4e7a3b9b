use axum::{extract::State, Json};

use super::response::ApiResponse;
use super::AppState;
use crate::error::AppError;
use crate::models::{MigrationRequest, MigrationResponse};

/// Migration phases 1 and 2: delete in the old mode, commit the new mode.
pub async fn migrate(
    State(state): State<AppState>,
    Json(request): Json<MigrationRequest>,
) -> Result<ApiResponse<MigrationResponse>, AppError> {
    let response = state.migration.migrate_deployment_type(&request).await?;
    Ok(ApiResponse::ok(response))
}

/// Migration phase 3: verify deletion and re-trigger deployment.
pub async fn trigger(
    State(state): State<AppState>,
    Json(request): Json<MigrationRequest>,
) -> Result<ApiResponse<MigrationResponse>, AppError> {
    let response = state.migration.trigger_after_migration(&request).await?;
    Ok(ApiResponse::ok(response))
}
