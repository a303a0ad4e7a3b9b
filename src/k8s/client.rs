//! Kubernetes client wrapper for the chart-store backend

use std::collections::BTreeMap;

use anyhow::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use tracing::{info, instrument};

/// Wrapper around kube::Client with helper methods for the ConfigMap/Secret
/// surface of the CD controller and for CRD annotation patches.
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8sClient using the default kubeconfig or in-cluster config
    #[instrument(skip_all)]
    pub async fn new() -> Result<Self> {
        let config = Config::infer().await?;
        let client = Client::try_from(config)?;

        info!("Connected to Kubernetes cluster");

        Ok(Self { client })
    }

    /// Get the inner kube Client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, kube::Error> {
        self.config_maps(namespace).get(name).await
    }

    pub async fn replace_config_map(
        &self,
        namespace: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, kube::Error> {
        let name = cm.metadata.name.as_deref().unwrap_or_default();
        self.config_maps(namespace)
            .replace(name, &PostParams::default(), cm)
            .await
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        self.secrets(namespace).get(name).await
    }

    pub async fn create_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, kube::Error> {
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
    }

    pub async fn replace_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<Secret, kube::Error> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.secrets(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
    }

    pub async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        match self
            .secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Patch annotations onto an arbitrary cluster-scoped resource with a
    /// strategic merge. Used to stamp Helm ownership onto CRDs before a
    /// GitOps installation is handed over to direct release.
    #[instrument(skip(self, annotations))]
    pub async fn annotate_cluster_resource(
        &self,
        group: &str,
        version: &str,
        kind: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), kube::Error> {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let patch = serde_json::json!({
            "metadata": { "annotations": annotations }
        });
        api.patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        info!(kind, name, "patched resource annotations");
        Ok(())
    }

    /// Check if cluster is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let version = self.client.apiserver_version().await?;
        info!(version = %version.git_version, "Kubernetes cluster is healthy");
        Ok(true)
    }
}
