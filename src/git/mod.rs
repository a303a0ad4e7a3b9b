//! GitOps commit collaborator. The pipeline commands it; rendering and
//! hosting live elsewhere.

mod client;

pub use client::GitCliClient;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GitError {
    #[error("git commit failed: {0}")]
    Commit(String),

    #[error("git push failed: {0}")]
    Push(String),

    #[error("git transport error: {0}")]
    Transport(String),
}

/// Result of committing one deployment's state to its GitOps repository.
#[derive(Debug, Clone)]
pub struct GitCommitResult {
    pub commit_hash: String,
    pub repo_url: String,
}

/// Contract for pushing chart state into a GitOps repository. The chart for
/// an `(app, environment)` pair always lives at the deployment-name path
/// inside the repository.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitOpsApi: Send + Sync {
    async fn commit_chart(
        &self,
        repo_url: &str,
        chart_path: &str,
        chart_ref: &str,
        chart_version: &str,
        values_yaml: &str,
    ) -> Result<GitCommitResult, GitError>;
}
