//! Error taxonomy for the chart-store backend.
//!
//! Variants map one-to-one onto the HTTP classes surfaced by the API layer;
//! background pipelines never propagate these outward, they record status and
//! let the read path observe the outcome.

use thiserror::Error;

use crate::cd::CdError;
use crate::git::GitError;
use crate::helm::ReleaseError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    /// Referenced chart repository is disabled; surfaced as 406.
    #[error("chart repository disabled: {0}")]
    ChartRepoDisabled(String),

    /// Target cluster cannot be reached; blocks migrations, surfaced as 422.
    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),

    #[error("{0}")]
    Conflict(String),

    /// Optimistic update on a controller ConfigMap/Secret lost three times.
    #[error("resource version not matched, attempted 3 times: {0}")]
    ResourceVersionConflict(String),

    /// Controller rejected the application spec or the render failed; the
    /// diagnostic is surfaced verbatim and never retried.
    #[error("{0}")]
    Irrecoverable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("cd controller error: {0}")]
    Controller(#[from] CdError),

    #[error("release error: {0}")]
    Release(#[from] ReleaseError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    /// HTTP status class of the primary error, per the API contract.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::NotFound(_) => 404,
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized(_) => 401,
            AppError::Forbidden(_) => 403,
            AppError::ChartRepoDisabled(_) => 406,
            AppError::ClusterUnreachable(_) => 422,
            AppError::Conflict(_) => 409,
            AppError::Controller(CdError::NotFound(_)) => 404,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(AppError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(AppError::ChartRepoDisabled("r".into()).status_code(), 406);
        assert_eq!(AppError::ClusterUnreachable("c".into()).status_code(), 422);
        assert_eq!(AppError::internal("boom").status_code(), 500);
    }
}
