//! Service layer: the orchestration between the state store, the bus and
//! the remote clients.

pub mod bulk;
pub mod chart_repo;
pub mod install;
pub mod migration;
pub mod reconciler;

pub use bulk::BulkService;
pub use chart_repo::ChartRepoService;
pub use install::InstallService;
pub use migration::MigrationService;
pub use reconciler::StatusReconciler;

use crate::models::DeploymentMode;

/// Delivery mode for a new installation: the caller's choice, bounded by
/// whether this process has GitOps integration at all.
pub(crate) fn resolve_deployment_mode(
    requested: Option<DeploymentMode>,
    gitops_enabled: bool,
) -> Result<DeploymentMode, crate::error::AppError> {
    match requested {
        Some(DeploymentMode::GitOps) if !gitops_enabled => Err(
            crate::error::AppError::BadRequest("gitops is not configured".to_string()),
        ),
        Some(mode) => Ok(mode),
        None if gitops_enabled => Ok(DeploymentMode::GitOps),
        None => Ok(DeploymentMode::DirectRelease),
    }
}

/// Repository URL for an app that does not bring a custom one.
pub(crate) fn default_repo_url(base: &Option<String>, app_name: &str) -> String {
    match base {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), app_name),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_deployment_mode() {
        assert_eq!(
            resolve_deployment_mode(None, true).unwrap(),
            DeploymentMode::GitOps
        );
        assert_eq!(
            resolve_deployment_mode(None, false).unwrap(),
            DeploymentMode::DirectRelease
        );
        assert_eq!(
            resolve_deployment_mode(Some(DeploymentMode::DirectRelease), true).unwrap(),
            DeploymentMode::DirectRelease
        );
        assert!(resolve_deployment_mode(Some(DeploymentMode::GitOps), false).is_err());
    }

    #[test]
    fn test_default_repo_url() {
        assert_eq!(
            default_repo_url(&Some("https://git.example.com/gitops/".into()), "nginx"),
            "https://git.example.com/gitops/nginx"
        );
        assert_eq!(default_repo_url(&None, "nginx"), "");
    }
}
