use serde::{Deserialize, Serialize};
use strum::Display;

use super::installed_app::{DeploymentMode, DeploymentStatus};

/// Request to install (or update to) one chart version in one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallAppRequest {
    pub app_name: String,
    pub team_id: i64,
    pub environment_id: i64,
    pub chart_version_id: i64,
    #[serde(default)]
    pub values_yaml: String,
    #[serde(default)]
    pub reference_value_id: Option<i64>,
    /// DEFAULT, TEMPLATE or DEPLOYED.
    #[serde(default)]
    pub reference_value_kind: Option<String>,
    #[serde(default)]
    pub deployment_mode: Option<DeploymentMode>,
    /// Custom GitOps repository; when absent a repository is derived from the
    /// configured base URL.
    #[serde(default)]
    pub git_ops_repo_url: Option<String>,
}

/// Request to promote a new version of an existing installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAppRequest {
    pub installed_app_id: i64,
    pub chart_version_id: i64,
    #[serde(default)]
    pub values_yaml: String,
    #[serde(default)]
    pub reference_value_id: Option<i64>,
    #[serde(default)]
    pub reference_value_kind: Option<String>,
}

/// One member of a bulk group install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartGroupInstallChartRequest {
    pub app_name: String,
    pub environment_id: i64,
    pub chart_version_id: i64,
    #[serde(default)]
    pub values_yaml: Option<String>,
    #[serde(default)]
    pub reference_value_id: Option<i64>,
    #[serde(default)]
    pub reference_value_kind: Option<String>,
    #[serde(default)]
    pub chart_group_entry_id: Option<i64>,
    #[serde(default)]
    pub default_cluster_component: bool,
}

/// Bulk group install request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartGroupInstallRequest {
    pub project_id: i64,
    #[serde(default)]
    pub chart_group_id: Option<i64>,
    pub charts: Vec<ChartGroupInstallChartRequest>,
}

/// Message published per deployment to the bulk-deploy topic. Replays that
/// find a terminal history row are no-ops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    pub installed_app_version_id: i64,
    pub installed_app_version_history_id: i64,
}

/// Request to retarget all active installations of an environment to the
/// other delivery mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRequest {
    pub env_id: i64,
    pub desired_deployment_mode: DeploymentMode,
    #[serde(default)]
    pub include_apps: Vec<i64>,
    #[serde(default)]
    pub exclude_apps: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
pub enum MigrationStatus {
    #[strum(serialize = "INITIATED")]
    #[serde(rename = "INITIATED")]
    Initiated,
    #[strum(serialize = "NOT_YET_DELETED")]
    #[serde(rename = "NOT_YET_DELETED")]
    NotYetDeleted,
    #[strum(serialize = "SUCCESS")]
    #[serde(rename = "SUCCESS")]
    Success,
    #[strum(serialize = "FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
}

/// Per-installation outcome of a migration phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentChangeStatus {
    pub installed_app_id: i64,
    pub app_id: i64,
    pub app_name: String,
    pub env_id: i64,
    pub env_name: String,
    pub error: String,
    pub status: MigrationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResponse {
    pub env_id: i64,
    pub desired_deployment_mode: DeploymentMode,
    pub successful_pipelines: Vec<DeploymentChangeStatus>,
    pub failed_pipelines: Vec<DeploymentChangeStatus>,
}

impl MigrationResponse {
    pub fn new(env_id: i64, desired: DeploymentMode) -> Self {
        Self {
            env_id,
            desired_deployment_mode: desired,
            successful_pipelines: Vec::new(),
            failed_pipelines: Vec::new(),
        }
    }
}

/// List filters for the installed-app listing endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledAppFilter {
    #[serde(default)]
    pub env_ids: Vec<i64>,
    #[serde(default)]
    pub cluster_ids: Vec<i64>,
    #[serde(default)]
    pub chart_repo_ids: Vec<i64>,
    #[serde(default)]
    pub app_statuses: Vec<DeploymentStatus>,
    #[serde(default)]
    pub only_deprecated: bool,
    #[serde(default)]
    pub app_store_name: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_size")]
    pub size: i64,
}

fn default_page_size() -> i64 {
    20
}

/// Bulk existence check for application names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppExistsRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppExistsEntry {
    pub name: String,
    pub exists: bool,
}
