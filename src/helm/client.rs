use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::types::{ReleaseApi, ReleaseError};

/// Drives the `helm` CLI against the cluster the process is configured for.
/// Multi-cluster routing happens upstream; the `cluster_id` parameter is
/// carried for the contract and logged.
#[derive(Clone)]
pub struct HelmClient;

impl HelmClient {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<String, ReleaseError> {
        let output = Command::new("helm")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ReleaseError::Transient(format!("failed to execute helm: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            if !stderr.is_empty() {
                warn!("helm stderr: {}", stderr.trim());
            }
            Ok(stdout)
        } else {
            Err(categorize(&stderr))
        }
    }
}

impl Default for HelmClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort helm failures into the caller-visible classes.
fn categorize(stderr: &str) -> ReleaseError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found") {
        ReleaseError::NotFound(stderr.trim().to_string())
    } else if lower.contains("parse error")
        || lower.contains("template")
        || lower.contains("execution error")
    {
        ReleaseError::Render(stderr.trim().to_string())
    } else if lower.contains("cannot re-use a name")
        || lower.contains("already exists")
        || lower.contains("is invalid")
        || lower.contains("unable to build kubernetes objects")
    {
        ReleaseError::Apply(stderr.trim().to_string())
    } else {
        ReleaseError::Transient(stderr.trim().to_string())
    }
}

#[async_trait]
impl ReleaseApi for HelmClient {
    async fn install(
        &self,
        release_name: &str,
        namespace: &str,
        chart_ref: &str,
        chart_version: &str,
        values_yaml: &str,
    ) -> Result<serde_json::Value, ReleaseError> {
        info!(release_name, chart_ref, namespace, "installing release");

        let values_file = format!("/tmp/chartstore-values-{}.yaml", release_name);
        let mut args = vec![
            "install",
            release_name,
            chart_ref,
            "--namespace",
            namespace,
            "--create-namespace",
            "--output",
            "json",
        ];
        if !chart_version.is_empty() {
            args.push("--version");
            args.push(chart_version);
        }
        if !values_yaml.is_empty() {
            tokio::fs::write(&values_file, values_yaml)
                .await
                .map_err(|e| ReleaseError::Transient(format!("failed to write values file: {e}")))?;
            args.push("--values");
            args.push(&values_file);
        }

        let result = self.run(&args).await;
        if !values_yaml.is_empty() {
            let _ = tokio::fs::remove_file(&values_file).await;
        }
        match result {
            Ok(stdout) => {
                info!(release_name, "release installed");
                Ok(serde_json::from_str(&stdout)
                    .unwrap_or_else(|_| serde_json::json!({ "raw": stdout })))
            }
            Err(e) => {
                error!(release_name, "helm install failed: {}", e);
                Err(e)
            }
        }
    }

    async fn get_detail(
        &self,
        cluster_id: i64,
        release_name: &str,
        namespace: &str,
    ) -> Result<serde_json::Value, ReleaseError> {
        info!(cluster_id, release_name, namespace, "fetching release detail");
        let stdout = self
            .run(&[
                "status",
                release_name,
                "--namespace",
                namespace,
                "--output",
                "json",
            ])
            .await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ReleaseError::Transient(format!("bad helm status output: {e}")))
    }

    async fn delete(
        &self,
        cluster_id: i64,
        release_name: &str,
        namespace: &str,
    ) -> Result<(), ReleaseError> {
        info!(cluster_id, release_name, namespace, "uninstalling release");
        self.run(&["uninstall", release_name, "--namespace", namespace])
            .await?;
        info!(release_name, "release uninstalled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert!(matches!(
            categorize("Error: release: not found"),
            ReleaseError::NotFound(_)
        ));
        assert!(matches!(
            categorize("Error: YAML parse error on nginx/values.yaml"),
            ReleaseError::Render(_)
        ));
        assert!(matches!(
            categorize("Error: cannot re-use a name that is still in use"),
            ReleaseError::Apply(_)
        ));
        assert!(matches!(
            categorize("Error: connection refused"),
            ReleaseError::Transient(_)
        ));
    }
}
