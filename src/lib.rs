//! Chart-Store Deployment Backend Library
//!
//! Installed-application lifecycle engine: state store, deployment pipeline,
//! bulk orchestration, status reconciliation and deployment-mode migration.

pub mod api;
pub mod auth;
pub mod bus;
pub mod cd;
pub mod config;
pub mod db;
pub mod error;
pub mod git;
pub mod helm;
pub mod k8s;
pub mod models;
pub mod naming;
pub mod pipeline;
pub mod service;

use axum::{
    routing::{delete, get, post, put},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the application router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Installed apps
        .route("/app-store/installed-app", post(api::installed_apps::create))
        .route("/app-store/installed-app", put(api::installed_apps::update))
        .route("/app-store/installed-app", get(api::installed_apps::list))
        .route(
            "/app-store/installed-app/:id",
            get(api::installed_apps::detail),
        )
        .route(
            "/app-store/installed-app/:id",
            delete(api::installed_apps::delete),
        )
        .route(
            "/app-store/installed-app/delete/:id/non-cascade",
            delete(api::installed_apps::delete_non_cascade),
        )
        // Bulk
        .route("/app-store/group/install", post(api::groups::install))
        .route(
            "/app-store/application/exists",
            post(api::installed_apps::exists),
        )
        .route(
            "/app-store/cluster-component/install/:cluster_id",
            post(api::groups::install_cluster_components),
        )
        // Migration
        .route(
            "/app-store/installed-app/migrate",
            post(api::migration::migrate),
        )
        .route(
            "/app-store/installed-app/trigger",
            post(api::migration::trigger),
        )
        // Deployment status
        .route(
            "/app-store/deployment-status/timeline/:installed_app_id/:env_id",
            get(api::installed_apps::timeline),
        )
        // Chart repositories
        .route("/app-store/chart-repo", post(api::chart_repos::create))
        .route("/app-store/chart-repo/:id", put(api::chart_repos::update))
        .route(
            "/app-store/chart-repo/:id",
            delete(api::chart_repos::delete),
        )
        .route(
            "/app-store/oci-registry",
            post(api::chart_repos::upsert_oci_registry),
        )
        .route(
            "/app-store/oci-registry",
            delete(api::chart_repos::delete_oci_registry),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}
