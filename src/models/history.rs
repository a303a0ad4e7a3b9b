use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of one deployment attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum HistoryStatus {
    #[strum(serialize = "Init")]
    Init,
    #[strum(serialize = "Progressing")]
    Progressing,
    #[strum(serialize = "Healthy")]
    Healthy,
    #[strum(serialize = "Degraded")]
    Degraded,
    #[strum(serialize = "Failed")]
    Failed,
    #[strum(serialize = "Aborted")]
    Aborted,
    #[strum(serialize = "Succeeded")]
    Succeeded,
}

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Init | HistoryStatus::Progressing)
    }
}

impl From<String> for HistoryStatus {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(HistoryStatus::Init)
    }
}

/// Immutable record of one deployment attempt. `git_hash` stays empty for
/// direct-release deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledAppVersionHistory {
    pub id: i64,
    pub installed_app_version_id: i64,
    pub git_hash: String,
    pub status: HistoryStatus,
    /// Opaque release-status blob captured from the release client.
    pub helm_release_status_config: Option<serde_json::Value>,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    pub updated_on: DateTime<Utc>,
}

/// Status events recorded against a history row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum TimelineStatus {
    #[strum(serialize = "DEPLOYMENT_INITIATED")]
    #[serde(rename = "DEPLOYMENT_INITIATED")]
    DeploymentInitiated,
    #[strum(serialize = "GIT_COMMIT")]
    #[serde(rename = "GIT_COMMIT")]
    GitCommit,
    #[strum(serialize = "GIT_COMMIT_FAILED")]
    #[serde(rename = "GIT_COMMIT_FAILED")]
    GitCommitFailed,
    #[strum(serialize = "CONTROLLER_SYNC_INITIATED")]
    #[serde(rename = "CONTROLLER_SYNC_INITIATED")]
    SyncInitiated,
    #[strum(serialize = "KUBECTL_APPLY_SYNCED")]
    #[serde(rename = "KUBECTL_APPLY_SYNCED")]
    KubectlApplySynced,
    #[strum(serialize = "FETCH_TIMED_OUT")]
    #[serde(rename = "FETCH_TIMED_OUT")]
    FetchTimedOut,
    #[strum(serialize = "UNABLE_TO_FETCH_STATUS")]
    #[serde(rename = "UNABLE_TO_FETCH_STATUS")]
    UnableToFetchStatus,
    #[strum(serialize = "HEALTHY")]
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[strum(serialize = "DEGRADED")]
    #[serde(rename = "DEGRADED")]
    Degraded,
}

impl TimelineStatus {
    /// A terminal timeline ends the attempt; nothing may be appended after.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TimelineStatus::Healthy | TimelineStatus::Degraded)
    }
}

impl From<String> for TimelineStatus {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(TimelineStatus::DeploymentInitiated)
    }
}

/// One entry in the append-only status timeline of a deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTimeline {
    pub id: i64,
    pub installed_app_version_history_id: i64,
    pub status: TimelineStatus,
    pub status_detail: String,
    pub status_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_history_statuses() {
        assert!(!HistoryStatus::Progressing.is_terminal());
        assert!(!HistoryStatus::Init.is_terminal());
        assert!(HistoryStatus::Healthy.is_terminal());
        assert!(HistoryStatus::Degraded.is_terminal());
        assert!(HistoryStatus::Succeeded.is_terminal());
        assert!(HistoryStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_terminal_timeline_statuses() {
        assert!(TimelineStatus::Healthy.is_terminal());
        assert!(TimelineStatus::Degraded.is_terminal());
        assert!(!TimelineStatus::KubectlApplySynced.is_terminal());
        assert!(!TimelineStatus::GitCommitFailed.is_terminal());
    }
}
