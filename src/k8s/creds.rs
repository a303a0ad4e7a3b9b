//! Projection of chart-repository and OCI-registry credentials into the CD
//! controller's configuration surface: the `repositories` key of its
//! ConfigMap and per-repository Secrets.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use url::Url;
use uuid::Uuid;

use super::client::K8sClient;
use super::retry::with_conflict_retry;
use crate::error::{AppError, AppResult};

const REPOSITORY_SECRET_LABEL_KEY: &str = "argocd.argoproj.io/secret-type";
const REPOSITORY_SECRET_LABEL_VALUE: &str = "repository";
const CONFIG_MAP_REPOSITORIES_KEY: &str = "repositories";
const REPOSITORY_TYPE_HELM: &str = "helm";

#[derive(Debug, Clone)]
pub struct ChartRepoAddRequest {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub allow_insecure_connection: bool,
    pub is_private: bool,
}

#[derive(Debug, Clone)]
pub struct ChartRepoUpdateRequest {
    pub name: String,
    pub previous_name: String,
    pub url: String,
    pub previous_url: String,
    pub username: String,
    pub password: String,
    pub allow_insecure_connection: bool,
    pub is_private: bool,
}

/// One entry of the controller ConfigMap's `repositories` YAML list. Unknown
/// keys of existing entries are carried through the round trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoEntry {
    name: String,
    url: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    repo_type: Option<String>,
    #[serde(rename = "usernameSecret", skip_serializing_if = "Option::is_none")]
    username_secret: Option<KeyRef>,
    #[serde(rename = "passwordSecret", skip_serializing_if = "Option::is_none")]
    password_secret: Option<KeyRef>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRef {
    name: String,
    key: String,
}

/// Parse a registry URL into `(host, fullRepoPath)`. A missing scheme is
/// tolerated; the path of the URL is joined with `repo`.
pub fn parse_registry_url(registry_url: &str, repo: &str) -> AppResult<(String, String)> {
    let candidate = if registry_url.contains("://") {
        registry_url.to_string()
    } else {
        format!("oci://{registry_url}")
    };
    let parsed = Url::parse(&candidate)
        .map_err(|e| AppError::BadRequest(format!("invalid registry url {registry_url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::BadRequest(format!("registry url {registry_url} has no host")))?
        .to_string();
    let path = parsed.path().trim_matches('/');
    let full_repo_path = if path.is_empty() {
        repo.to_string()
    } else {
        format!("{path}/{repo}")
    };
    Ok((host, full_repo_path))
}

/// Chart name is the last segment of the full repository path.
pub fn chart_name_of(full_repo_path: &str) -> String {
    full_repo_path
        .rsplit('/')
        .next()
        .unwrap_or(full_repo_path)
        .to_string()
}

fn oci_secret_data(
    username: &str,
    password: &str,
    full_repo_path: &str,
    host: &str,
    is_public: bool,
) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    // the controller resolves application sources against this name
    data.insert("name".to_string(), full_repo_path.to_string());
    data.insert("type".to_string(), REPOSITORY_TYPE_HELM.to_string());
    data.insert("url".to_string(), host.to_string());
    if !is_public {
        data.insert("username".to_string(), username.to_string());
        data.insert("password".to_string(), password.to_string());
    }
    data.insert("enableOCI".to_string(), "true".to_string());
    data
}

fn chart_repo_secret_data(request: &ChartRepoAddRequest) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    // unique suffix so repeated registrations of one logical name do not
    // collide inside the controller's repo server
    data.insert(
        "name".to_string(),
        format!("{}-{}", request.name, Uuid::new_v4()),
    );
    data.insert("type".to_string(), REPOSITORY_TYPE_HELM.to_string());
    data.insert("url".to_string(), request.url.clone());
    if request.is_private {
        data.insert("username".to_string(), request.username.clone());
        data.insert("password".to_string(), request.password.clone());
    }
    data.insert(
        "insecure".to_string(),
        if request.allow_insecure_connection {
            "true".to_string()
        } else {
            "false".to_string()
        },
    );
    data
}

fn upsert_entry(entries: &mut Vec<RepoEntry>, request: &ChartRepoUpdateRequest) {
    for entry in entries.iter_mut() {
        if entry.name == request.name {
            entry.url = request.url.clone();
            entry.username_secret = Some(KeyRef {
                name: request.username.clone(),
                key: "username".to_string(),
            });
            entry.password_secret = Some(KeyRef {
                name: request.password.clone(),
                key: "password".to_string(),
            });
            return;
        }
    }
    entries.push(RepoEntry {
        name: request.name.clone(),
        url: request.url.clone(),
        repo_type: Some(REPOSITORY_TYPE_HELM.to_string()),
        username_secret: Some(KeyRef {
            name: request.username.clone(),
            key: "username".to_string(),
        }),
        password_secret: Some(KeyRef {
            name: request.password.clone(),
            key: "password".to_string(),
        }),
        extra: serde_json::Map::new(),
    });
}

fn remove_entry(entries: &mut Vec<RepoEntry>, name: &str) -> AppResult<()> {
    let before = entries.len();
    entries.retain(|e| e.name != name);
    if entries.len() == before {
        return Err(AppError::NotFound(format!(
            "repository {name} not found in controller config map"
        )));
    }
    Ok(())
}

fn parse_entries(raw: Option<&String>) -> AppResult<Vec<RepoEntry>> {
    match raw {
        Some(s) if !s.trim().is_empty() => serde_yaml::from_str(s)
            .map_err(|e| AppError::internal(format!("bad repositories yaml in config map: {e}"))),
        _ => Ok(Vec::new()),
    }
}

fn render_entries(entries: &[RepoEntry]) -> AppResult<String> {
    serde_yaml::to_string(entries)
        .map_err(|e| AppError::internal(format!("failed to render repositories yaml: {e}")))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Writes chart repository credentials into the controller's namespace.
#[derive(Clone)]
pub struct RepositoryCreds {
    k8s: K8sClient,
    namespace: String,
    config_map_name: String,
}

impl RepositoryCreds {
    pub fn new(k8s: K8sClient, namespace: String, config_map_name: String) -> Self {
        Self {
            k8s,
            namespace,
            config_map_name,
        }
    }

    fn repository_secret(&self, name: &str, data: BTreeMap<String, String>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(
                    [(
                        REPOSITORY_SECRET_LABEL_KEY.to_string(),
                        REPOSITORY_SECRET_LABEL_VALUE.to_string(),
                    )]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            string_data: Some(data),
            ..Default::default()
        }
    }

    async fn create_or_update_secret(
        &self,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> AppResult<()> {
        with_conflict_retry("repository secret update", || {
            let data = data.clone();
            async move {
                match self.k8s.get_secret(&self.namespace, name).await {
                    Ok(mut existing) => {
                        existing.string_data = Some(data);
                        self.k8s.replace_secret(&self.namespace, &existing).await?;
                    }
                    Err(err) if is_not_found(&err) => {
                        let secret = self.repository_secret(name, data);
                        self.k8s.create_secret(&self.namespace, &secret).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
                Ok(())
            }
        })
        .await
    }

    /// Create or update the Secret projecting an OCI registry credential.
    /// Public registries omit the username/password fields.
    #[instrument(skip(self, username, password))]
    pub async fn add_or_update_oci_registry(
        &self,
        registry_url: &str,
        repo: &str,
        username: &str,
        password: &str,
        is_public: bool,
        unique_id: i64,
    ) -> AppResult<()> {
        let (host, full_repo_path) = parse_registry_url(registry_url, repo)?;
        let secret_name = format!("{}-{}", chart_name_of(&full_repo_path), unique_id);
        let data = oci_secret_data(username, password, &full_repo_path, &host, is_public);
        self.create_or_update_secret(&secret_name, data).await?;
        info!(secret_name, "projected oci registry credential");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_oci_registry(
        &self,
        registry_url: &str,
        repo: &str,
        unique_id: i64,
    ) -> AppResult<()> {
        let (_host, full_repo_path) = parse_registry_url(registry_url, repo)?;
        let secret_name = format!("{}-{}", chart_name_of(&full_repo_path), unique_id);
        self.k8s.delete_secret(&self.namespace, &secret_name).await?;
        Ok(())
    }

    /// Register a plain chart repository as a Secret.
    #[instrument(skip(self, request), fields(repo = %request.name))]
    pub async fn add_chart_repo(&self, request: &ChartRepoAddRequest) -> AppResult<()> {
        with_conflict_retry("chart repo secret create", || async move {
            let data = chart_repo_secret_data(request);
            let secret = self.repository_secret(&request.name, data);
            match self.k8s.create_secret(&self.namespace, &secret).await {
                Ok(_) => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
        .await?;
        info!("chart repository registered");
        Ok(())
    }

    /// Update a chart repository wherever it currently lives: as an entry in
    /// the controller ConfigMap, as a Secret, or nowhere yet. A rename is
    /// delete-old plus create-new.
    #[instrument(skip(self, request), fields(repo = %request.name))]
    pub async fn update_chart_repo(&self, request: &ChartRepoUpdateRequest) -> AppResult<()> {
        with_conflict_retry("chart repo update", || async move {
            let mut cm = self
                .k8s
                .get_config_map(&self.namespace, &self.config_map_name)
                .await?;
            let data = cm.data.clone().unwrap_or_default();
            let mut entries = parse_entries(data.get(CONFIG_MAP_REPOSITORIES_KEY))?;
            let in_config_map = entries
                .iter()
                .any(|e| e.name == request.previous_name && e.url == request.previous_url);

            if in_config_map {
                upsert_entry(&mut entries, request);
                if request.previous_name != request.name {
                    remove_entry(&mut entries, &request.previous_name)?;
                }
                let mut data = data;
                data.insert(CONFIG_MAP_REPOSITORIES_KEY.to_string(), render_entries(&entries)?);
                cm.data = Some(data);
                self.k8s.replace_config_map(&self.namespace, &cm).await?;
                return Ok(());
            }

            let add = ChartRepoAddRequest {
                name: request.name.clone(),
                url: request.url.clone(),
                username: request.username.clone(),
                password: request.password.clone(),
                allow_insecure_connection: request.allow_insecure_connection,
                is_private: request.is_private,
            };
            let secret_data = chart_repo_secret_data(&add);
            match self
                .k8s
                .get_secret(&self.namespace, &request.previous_name)
                .await
            {
                Err(err) if is_not_found(&err) => {
                    // never projected before, create under the previous name
                    let secret = self.repository_secret(&request.previous_name, secret_data);
                    self.k8s.create_secret(&self.namespace, &secret).await?;
                }
                Err(err) => return Err(err.into()),
                Ok(mut existing) => {
                    if request.previous_name != request.name {
                        self.k8s
                            .delete_secret(&self.namespace, &request.previous_name)
                            .await?;
                        let secret = self.repository_secret(&request.name, secret_data);
                        self.k8s.create_secret(&self.namespace, &secret).await?;
                    } else {
                        existing.string_data = Some(secret_data);
                        self.k8s.replace_secret(&self.namespace, &existing).await?;
                    }
                }
            }
            Ok(())
        })
        .await?;
        info!("chart repository updated");
        Ok(())
    }

    /// Remove a chart repository from whichever surface holds it.
    #[instrument(skip(self))]
    pub async fn delete_chart_repo(&self, name: &str, url: &str) -> AppResult<()> {
        with_conflict_retry("chart repo delete", || async move {
            let mut cm = self
                .k8s
                .get_config_map(&self.namespace, &self.config_map_name)
                .await?;
            let data = cm.data.clone().unwrap_or_default();
            let mut entries = parse_entries(data.get(CONFIG_MAP_REPOSITORIES_KEY))?;
            let in_config_map = entries.iter().any(|e| e.name == name && e.url == url);

            if in_config_map {
                remove_entry(&mut entries, name)?;
                let mut data = data;
                data.insert(CONFIG_MAP_REPOSITORIES_KEY.to_string(), render_entries(&entries)?);
                cm.data = Some(data);
                self.k8s.replace_config_map(&self.namespace, &cm).await?;
            } else {
                self.k8s.delete_secret(&self.namespace, name).await?;
            }
            Ok(())
        })
        .await?;
        info!(name, "chart repository removed");
        Ok(())
    }
}
