use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ReleaseError {
    #[error("release {0} not found")]
    NotFound(String),

    /// Chart failed to render; surfaced verbatim, never retried.
    #[error("render error: {0}")]
    Render(String),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("transient release error: {0}")]
    Transient(String),
}

impl ReleaseError {
    pub fn means_absent(&self) -> bool {
        matches!(self, ReleaseError::NotFound(_))
    }
}

/// Remote contract of the release backend. Install is not assumed
/// idempotent; callers hold the installed-app row lock to guarantee at most
/// one in-flight install per `(release, namespace, cluster)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReleaseApi: Send + Sync {
    /// Install a chart and return the opaque release-status blob.
    async fn install(
        &self,
        release_name: &str,
        namespace: &str,
        chart_ref: &str,
        chart_version: &str,
        values_yaml: &str,
    ) -> Result<serde_json::Value, ReleaseError>;

    async fn get_detail(
        &self,
        cluster_id: i64,
        release_name: &str,
        namespace: &str,
    ) -> Result<serde_json::Value, ReleaseError>;

    async fn delete(
        &self,
        cluster_id: i64,
        release_name: &str,
        namespace: &str,
    ) -> Result<(), ReleaseError>;
}
