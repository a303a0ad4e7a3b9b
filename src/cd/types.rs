use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CdError {
    /// The application (or its resource tree) is gone; recoverable signal
    /// for deletions that already happened externally.
    #[error("application {0} not found on controller")]
    NotFound(String),

    #[error("repository already registered with different settings: {0}")]
    AlreadyExistsButDifferent(String),

    /// The controller rejected the application spec; surfaced verbatim,
    /// never retried.
    #[error("{0}")]
    InvalidSpec(String),

    #[error("controller transport error: {0}")]
    Transport(String),
}

impl CdError {
    /// Errors that mean "the application does not exist", used by the
    /// migration trigger phase to confirm the old resource is gone.
    pub fn means_absent(&self) -> bool {
        matches!(self, CdError::NotFound(_))
    }
}

/// Application health from the controller's perspective. Consumed, not
/// owned: `Healthy` is terminal success, `Degraded` past the degradation
/// threshold is terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Missing,
    Progressing,
    Healthy,
    Degraded,
    Suspended,
    Unknown,
}

impl HealthStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Missing" => HealthStatus::Missing,
            "Progressing" => HealthStatus::Progressing,
            "Healthy" => HealthStatus::Healthy,
            "Degraded" => HealthStatus::Degraded,
            "Suspended" => HealthStatus::Suspended,
            _ => HealthStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshType {
    None,
    /// Triggers a controller-side refresh before the status is returned.
    Normal,
}

/// Observed state of a controller application.
#[derive(Debug, Clone)]
pub struct AppObserved {
    pub health: HealthStatus,
    pub auto_sync_enabled: bool,
    pub revision: String,
    pub message: String,
}

/// Spec handed to the controller when creating or updating an application.
#[derive(Debug, Clone)]
pub struct AppSpecRequest {
    pub name: String,
    pub repo_url: String,
    pub path: String,
    pub target_revision: String,
    pub dest_server: String,
    pub dest_namespace: String,
    pub auto_sync: bool,
}

/// One node of the live resource graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// Remote contract of the CD controller. A trait so tests can substitute the
/// remote; the only production implementation is [`super::CdClient`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Idempotent repository registration.
    async fn register_repo(&self, repo_url: &str) -> Result<(), CdError>;

    async fn create_app(&self, spec: &AppSpecRequest) -> Result<(), CdError>;

    /// Toggle automated sync; when enabling, prune is asserted alongside.
    async fn update_sync_policy(&self, name: &str, auto: bool) -> Result<(), CdError>;

    /// Explicit sync, used only when automated sync is disabled.
    async fn sync(&self, name: &str, revision: &str, prune: bool) -> Result<(), CdError>;

    async fn get(&self, name: &str, refresh: RefreshType) -> Result<AppObserved, CdError>;

    async fn resource_tree(&self, name: &str) -> Result<Vec<ResourceRef>, CdError>;

    async fn delete(&self, name: &str, cascade: bool) -> Result<(), CdError>;
}
