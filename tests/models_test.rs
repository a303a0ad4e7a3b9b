//! Tests for data models
//!
//! Verifies the wire shapes of the DTOs exchanged with the UI and the bus.

use chartstore_backend::models::{
    DeployPayload, DeploymentMode, DeploymentStatus, HistoryStatus, InstallAppRequest,
    MigrationRequest, TimelineStatus,
};
use serde_json::json;

#[test]
fn test_deploy_payload_wire_shape() {
    let payload = DeployPayload {
        installed_app_version_id: 42,
        installed_app_version_history_id: 99,
    };
    let value = serde_json::to_value(&payload).unwrap();
    assert_eq!(
        value,
        json!({"installedAppVersionId": 42, "installedAppVersionHistoryId": 99})
    );

    let parsed: DeployPayload =
        serde_json::from_value(json!({"installedAppVersionId": 1, "installedAppVersionHistoryId": 2}))
            .unwrap();
    assert_eq!(parsed.installed_app_version_id, 1);
    assert_eq!(parsed.installed_app_version_history_id, 2);
}

#[test]
fn test_install_request_defaults() {
    let request: InstallAppRequest = serde_json::from_value(json!({
        "appName": "nginx",
        "teamId": 1,
        "environmentId": 2,
        "chartVersionId": 3
    }))
    .unwrap();
    assert_eq!(request.app_name, "nginx");
    assert_eq!(request.values_yaml, "");
    assert!(request.deployment_mode.is_none());
    assert!(request.git_ops_repo_url.is_none());
}

#[test]
fn test_migration_request_parsing() {
    let request: MigrationRequest = serde_json::from_value(json!({
        "envId": 7,
        "desiredDeploymentMode": "helm",
        "includeApps": [1, 2]
    }))
    .unwrap();
    assert_eq!(request.env_id, 7);
    assert_eq!(
        request.desired_deployment_mode,
        DeploymentMode::DirectRelease
    );
    assert_eq!(request.include_apps, vec![1, 2]);
    assert!(request.exclude_apps.is_empty());
}

#[test]
fn test_status_string_forms() {
    assert_eq!(DeploymentStatus::DeployInit.to_string(), "DEPLOY_INIT");
    assert_eq!(DeploymentStatus::QueueError.to_string(), "QUEUE_ERROR");
    assert_eq!(HistoryStatus::Progressing.to_string(), "Progressing");
    assert_eq!(
        TimelineStatus::KubectlApplySynced.to_string(),
        "KUBECTL_APPLY_SYNCED"
    );
    assert_eq!(DeploymentMode::GitOps.to_string(), "gitops");
    assert_eq!(DeploymentMode::DirectRelease.to_string(), "helm");
}

#[test]
fn test_timeline_terminality() {
    for status in [TimelineStatus::Healthy, TimelineStatus::Degraded] {
        assert!(status.is_terminal());
    }
    for status in [
        TimelineStatus::DeploymentInitiated,
        TimelineStatus::GitCommit,
        TimelineStatus::SyncInitiated,
        TimelineStatus::KubectlApplySynced,
        TimelineStatus::FetchTimedOut,
        TimelineStatus::UnableToFetchStatus,
    ] {
        assert!(!status.is_terminal());
    }
}
