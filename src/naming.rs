//! Stable names presented to the CD controller and the release client.

use crate::models::{AppType, InstalledAppDetail};

/// The deployment name for an `(app, environment)` pair. No truncation or
/// normalization; collisions are a caller responsibility at creation time.
pub fn deployment_name_for(app_name: &str, env_name: &str) -> String {
    format!("{}-{}", app_name, env_name)
}

/// Identifier external reconcilers use for idempotent lookups. External helm
/// apps are qualified by namespace and cluster; chart-store-managed apps are
/// unique by name already.
pub fn unique_identifier(detail: &InstalledAppDetail) -> String {
    match detail.app_type {
        AppType::ExternalHelm => format!(
            "{}-{}-{}",
            detail.app_name, detail.namespace, detail.cluster_id
        ),
        _ => detail.app_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DeploymentMode, DeploymentStatus, InstalledApp, OfferingMode,
    };
    use chrono::Utc;

    fn detail(app_type: AppType) -> InstalledAppDetail {
        InstalledAppDetail {
            installed_app: InstalledApp {
                id: 1,
                app_id: 10,
                environment_id: 20,
                deployment_mode: DeploymentMode::DirectRelease,
                git_ops_repo_url: String::new(),
                is_custom_repo: false,
                status: DeploymentStatus::Init,
                delete_requested: false,
                notes: String::new(),
                active: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            app_name: "nginx".to_string(),
            app_type,
            offering_mode: OfferingMode::Full,
            environment_name: "dev".to_string(),
            namespace: "apps".to_string(),
            cluster_id: 3,
        }
    }

    #[test]
    fn test_deployment_name() {
        assert_eq!(deployment_name_for("nginx", "dev"), "nginx-dev");
        // no normalization, whatever the caller passes is used literally
        assert_eq!(deployment_name_for("My.App", "Prod_1"), "My.App-Prod_1");
    }

    #[test]
    fn test_unique_identifier() {
        assert_eq!(unique_identifier(&detail(AppType::ChartStore)), "nginx");
        assert_eq!(
            unique_identifier(&detail(AppType::ExternalHelm)),
            "nginx-apps-3"
        );
    }
}
