use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::app::{AppType, OfferingMode};

/// Delivery mode of an installed application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq, Hash)]
pub enum DeploymentMode {
    /// Reconciled from a Git repository by the CD controller.
    #[strum(serialize = "gitops")]
    #[serde(rename = "gitops")]
    GitOps,
    /// Installed directly as a Helm-shaped release.
    #[strum(serialize = "helm")]
    #[serde(rename = "helm")]
    DirectRelease,
}

/// Pipeline status of an installed application, written by the deployment
/// worker and the enqueue path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum DeploymentStatus {
    #[strum(serialize = "INIT")]
    #[serde(rename = "INIT")]
    Init,
    #[strum(serialize = "ENQUEUED")]
    #[serde(rename = "ENQUEUED")]
    Enqueued,
    #[strum(serialize = "QUEUE_ERROR")]
    #[serde(rename = "QUEUE_ERROR")]
    QueueError,
    #[strum(serialize = "DEPLOY_INIT")]
    #[serde(rename = "DEPLOY_INIT")]
    DeployInit,
    #[strum(serialize = "GIT_ERROR")]
    #[serde(rename = "GIT_ERROR")]
    GitError,
    #[strum(serialize = "GIT_SUCCESS")]
    #[serde(rename = "GIT_SUCCESS")]
    GitSuccess,
    #[strum(serialize = "CONTROLLER_ERROR")]
    #[serde(rename = "CONTROLLER_ERROR")]
    ControllerError,
    #[strum(serialize = "CONTROLLER_SUCCESS")]
    #[serde(rename = "CONTROLLER_SUCCESS")]
    ControllerSuccess,
    #[strum(serialize = "HELM_ERROR")]
    #[serde(rename = "HELM_ERROR")]
    HelmError,
    #[strum(serialize = "SUCCESS")]
    #[serde(rename = "SUCCESS")]
    Success,
}

impl DeploymentStatus {
    /// Statuses from which a (re)deployment attempt may start the Git stage.
    pub fn allows_git_stage(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Init
                | DeploymentStatus::DeployInit
                | DeploymentStatus::Enqueued
                | DeploymentStatus::QueueError
                | DeploymentStatus::GitError
        )
    }

    /// Statuses from which the controller-registration stage may run.
    pub fn allows_controller_stage(&self) -> bool {
        self.allows_git_stage()
            || matches!(
                self,
                DeploymentStatus::GitSuccess | DeploymentStatus::ControllerError
            )
    }
}

impl From<String> for DeploymentStatus {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(DeploymentStatus::Init)
    }
}

/// The binding of one application to one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledApp {
    pub id: i64,
    pub app_id: i64,
    pub environment_id: i64,
    pub deployment_mode: DeploymentMode,
    /// Present iff `deployment_mode` is GitOps.
    pub git_ops_repo_url: String,
    pub is_custom_repo: bool,
    pub status: DeploymentStatus,
    pub delete_requested: bool,
    pub notes: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One intended version of an installed application. Exactly one version is
/// active per installed app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledAppVersion {
    pub id: i64,
    pub installed_app_id: i64,
    pub chart_version_id: i64,
    pub values_yaml: String,
    pub reference_value_id: Option<i64>,
    pub reference_value_kind: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Installed app joined with its owning application and target environment,
/// the shape most of the service layer works with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledAppDetail {
    pub installed_app: InstalledApp,
    pub app_name: String,
    pub app_type: AppType,
    pub offering_mode: OfferingMode,
    pub environment_name: String,
    pub namespace: String,
    pub cluster_id: i64,
}

impl InstalledAppDetail {
    pub fn id(&self) -> i64 {
        self.installed_app.id
    }

    pub fn app_id(&self) -> i64 {
        self.installed_app.app_id
    }

    pub fn environment_id(&self) -> i64 {
        self.installed_app.environment_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            "INIT",
            "ENQUEUED",
            "QUEUE_ERROR",
            "DEPLOY_INIT",
            "GIT_ERROR",
            "GIT_SUCCESS",
            "CONTROLLER_ERROR",
            "CONTROLLER_SUCCESS",
            "HELM_ERROR",
            "SUCCESS",
        ] {
            let parsed: DeploymentStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_retry_gates() {
        assert!(DeploymentStatus::GitError.allows_git_stage());
        assert!(!DeploymentStatus::GitSuccess.allows_git_stage());
        assert!(DeploymentStatus::GitSuccess.allows_controller_stage());
        assert!(DeploymentStatus::ControllerError.allows_controller_stage());
        assert!(!DeploymentStatus::Success.allows_controller_stage());
    }
}
