use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use super::{GitCommitResult, GitError, GitOpsApi};

/// Drives the `git` CLI against a local working tree per repository. The
/// working tree is exclusively owned by this process; concurrent writers to
/// one repository are rejected at installation time.
#[derive(Clone)]
pub struct GitCliClient {
    workdir: PathBuf,
}

impl GitCliClient {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn checkout_dir(&self, repo_url: &str) -> PathBuf {
        let name = repo_url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("repo");
        self.workdir.join(name)
    }

    async fn git(&self, dir: Option<&PathBuf>, args: &[&str]) -> Result<String, GitError> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        let output = cmd
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| GitError::Transport(format!("failed to execute git: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            // git reports some failures on stdout ("nothing to commit")
            let message = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };
            Err(GitError::Transport(message.trim().to_string()))
        }
    }

    async fn clone_or_pull(&self, repo_url: &str) -> Result<PathBuf, GitError> {
        let dir = self.checkout_dir(repo_url);
        if dir.join(".git").exists() {
            self.git(Some(&dir), &["pull", "--ff-only", "origin", "master"])
                .await?;
        } else {
            tokio::fs::create_dir_all(&self.workdir)
                .await
                .map_err(|e| GitError::Transport(format!("failed to create workdir: {e}")))?;
            let dir_s = dir.to_string_lossy().to_string();
            self.git(None, &["clone", repo_url, &dir_s]).await?;
        }
        Ok(dir)
    }
}

#[async_trait]
impl GitOpsApi for GitCliClient {
    #[instrument(skip(self, values_yaml))]
    async fn commit_chart(
        &self,
        repo_url: &str,
        chart_path: &str,
        chart_ref: &str,
        chart_version: &str,
        values_yaml: &str,
    ) -> Result<GitCommitResult, GitError> {
        let dir = self.clone_or_pull(repo_url).await?;

        let chart_dir = dir.join(chart_path);
        tokio::fs::create_dir_all(&chart_dir)
            .await
            .map_err(|e| GitError::Commit(format!("failed to create chart dir: {e}")))?;
        tokio::fs::write(chart_dir.join("values.yaml"), values_yaml)
            .await
            .map_err(|e| GitError::Commit(format!("failed to write values: {e}")))?;
        let requirements = format!("chart: {chart_ref}\nversion: {chart_version}\n");
        tokio::fs::write(chart_dir.join("requirements.yaml"), requirements)
            .await
            .map_err(|e| GitError::Commit(format!("failed to write requirements: {e}")))?;

        self.git(Some(&dir), &["add", "-A"]).await?;
        let message = format!("update {chart_path} to {chart_ref}:{chart_version}");
        match self
            .git(
                Some(&dir),
                &[
                    "-c",
                    "user.name=chartstore",
                    "-c",
                    "user.email=chartstore@local",
                    "commit",
                    "-m",
                    &message,
                ],
            )
            .await
        {
            Ok(_) => {}
            // an identical re-deploy leaves nothing to commit, reuse HEAD
            Err(GitError::Transport(msg)) if msg.contains("nothing to commit") => {}
            Err(e) => return Err(GitError::Commit(e.to_string())),
        }

        self.git(Some(&dir), &["push", "origin", "HEAD:master"])
            .await
            .map_err(|e| GitError::Push(e.to_string()))?;

        let commit_hash = self
            .git(Some(&dir), &["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();
        info!(chart_path, commit_hash, "committed chart state");

        Ok(GitCommitResult {
            commit_hash,
            repo_url: repo_url.to_string(),
        })
    }
}
