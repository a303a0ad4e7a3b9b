use std::time::Duration;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{info, instrument, warn};

use super::proto;
use super::proto::application_service_client::ApplicationServiceClient;
use super::proto::repository_service_client::RepositoryServiceClient;
use super::types::{
    AppObserved, AppSpecRequest, CdError, ControllerApi, HealthStatus, RefreshType, ResourceRef,
};

/// Operation-class timeouts.
const FAST: Duration = Duration::from_secs(10);
const SLOW: Duration = Duration::from_secs(30);
const LAZY: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AuthInterceptor {
    token: Option<MetadataValue<Ascii>>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        Ok(request)
    }
}

/// gRPC client for the CD controller. Built only when GitOps is configured;
/// in agent mode the process simply never constructs one.
#[derive(Clone)]
pub struct CdClient {
    channel: Channel,
    interceptor: AuthInterceptor,
}

impl CdClient {
    pub fn connect(endpoint: &str, auth_token: Option<&str>) -> Result<Self, CdError> {
        let endpoint = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| CdError::Transport(format!("invalid controller endpoint: {e}")))?;
        let channel = endpoint.connect_lazy();
        let token = match auth_token {
            Some(t) => Some(
                format!("Bearer {t}")
                    .parse()
                    .map_err(|_| CdError::Transport("auth token is not valid ascii".into()))?,
            ),
            None => None,
        };
        info!("CD controller client initialized");
        Ok(Self {
            channel,
            interceptor: AuthInterceptor { token },
        })
    }

    fn apps(
        &self,
    ) -> ApplicationServiceClient<
        tonic::service::interceptor::InterceptedService<Channel, AuthInterceptor>,
    > {
        ApplicationServiceClient::with_interceptor(self.channel.clone(), self.interceptor.clone())
    }

    fn repos(
        &self,
    ) -> RepositoryServiceClient<
        tonic::service::interceptor::InterceptedService<Channel, AuthInterceptor>,
    > {
        RepositoryServiceClient::with_interceptor(self.channel.clone(), self.interceptor.clone())
    }

    async fn get_application(
        &self,
        name: &str,
        refresh: RefreshType,
    ) -> Result<proto::Application, CdError> {
        let request = proto::ApplicationQuery {
            name: name.to_string(),
            refresh: match refresh {
                RefreshType::Normal => "normal".to_string(),
                RefreshType::None => String::new(),
            },
        };
        let mut client = self.apps();
        let response = timed(FAST, client.get(request))
            .await
            .map_err(|s| map_status(name, s))?;
        Ok(response.into_inner())
    }
}

async fn timed<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<tonic::Response<T>, Status>>,
) -> Result<tonic::Response<T>, Status> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Status::deadline_exceeded(format!(
            "no response within {}s",
            limit.as_secs()
        ))),
    }
}

fn map_status(name: &str, status: Status) -> CdError {
    match status.code() {
        Code::NotFound => CdError::NotFound(name.to_string()),
        Code::AlreadyExists => CdError::AlreadyExistsButDifferent(status.message().to_string()),
        Code::InvalidArgument | Code::FailedPrecondition => {
            CdError::InvalidSpec(status.message().to_string())
        }
        _ => CdError::Transport(status.message().to_string()),
    }
}

#[async_trait::async_trait]
impl ControllerApi for CdClient {
    #[instrument(skip(self))]
    async fn register_repo(&self, repo_url: &str) -> Result<(), CdError> {
        let request = proto::RepoRegisterRequest {
            repo_url: repo_url.to_string(),
            upsert: true,
        };
        let mut client = self.repos();
        timed(SLOW, client.register(request))
            .await
            .map_err(|s| map_status(repo_url, s))?;
        info!(repo_url, "registered gitops repository");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(app = %spec.name))]
    async fn create_app(&self, spec: &AppSpecRequest) -> Result<(), CdError> {
        let application = proto::Application {
            name: spec.name.clone(),
            spec: Some(proto::ApplicationSpec {
                source: Some(proto::ApplicationSource {
                    repo_url: spec.repo_url.clone(),
                    path: spec.path.clone(),
                    target_revision: spec.target_revision.clone(),
                }),
                destination: Some(proto::ApplicationDestination {
                    server: spec.dest_server.clone(),
                    namespace: spec.dest_namespace.clone(),
                }),
                sync_policy: Some(proto::SyncPolicy {
                    automated: spec.auto_sync,
                    prune: spec.auto_sync,
                }),
            }),
            status: None,
        };
        let request = proto::ApplicationCreateRequest {
            application: Some(application),
            upsert: true,
        };
        let mut client = self.apps();
        timed(SLOW, client.create(request))
            .await
            .map_err(|s| map_status(&spec.name, s))?;
        info!("created application on controller");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_sync_policy(&self, name: &str, auto: bool) -> Result<(), CdError> {
        let current = self.get_application(name, RefreshType::None).await?;
        let mut spec = current.spec.unwrap_or_default();
        spec.sync_policy = Some(proto::SyncPolicy {
            automated: auto,
            prune: auto,
        });
        let request = proto::ApplicationUpdateSpecRequest {
            name: name.to_string(),
            spec: Some(spec),
        };
        let mut client = self.apps();
        timed(SLOW, client.update_spec(request))
            .await
            .map_err(|s| map_status(name, s))?;
        info!(auto, "updated sync policy");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sync(&self, name: &str, revision: &str, prune: bool) -> Result<(), CdError> {
        let request = proto::ApplicationSyncRequest {
            name: name.to_string(),
            revision: revision.to_string(),
            prune,
        };
        let mut client = self.apps();
        timed(SLOW, client.sync(request))
            .await
            .map_err(|s| map_status(name, s))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str, refresh: RefreshType) -> Result<AppObserved, CdError> {
        let application = self.get_application(name, refresh).await?;
        let status = application.status.unwrap_or_default();
        let auto_sync_enabled = application
            .spec
            .and_then(|s| s.sync_policy)
            .map(|p| p.automated)
            .unwrap_or(false);
        Ok(AppObserved {
            health: HealthStatus::parse(&status.health),
            auto_sync_enabled,
            revision: status.revision,
            message: status.message,
        })
    }

    #[instrument(skip(self))]
    async fn resource_tree(&self, name: &str) -> Result<Vec<ResourceRef>, CdError> {
        let request = proto::ResourcesQuery {
            application_name: name.to_string(),
        };
        let mut client = self.apps();
        let response = timed(LAZY, client.resource_tree(request))
            .await
            .map_err(|s| map_status(name, s))?;
        Ok(response
            .into_inner()
            .nodes
            .into_iter()
            .map(|n| ResourceRef {
                group: n.group,
                version: n.version,
                kind: n.kind,
                name: n.name,
                namespace: n.namespace,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str, cascade: bool) -> Result<(), CdError> {
        let request = proto::ApplicationDeleteRequest {
            name: name.to_string(),
            cascade,
        };
        let mut client = self.apps();
        match timed(SLOW, client.delete(request)).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => {
                // already gone, delete is idempotent
                warn!(name, "application already absent on delete");
                Ok(())
            }
            Err(status) => Err(map_status(name, status)),
        }
    }
}
