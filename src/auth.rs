//! Request-scoped context and the consumed contract of the external policy
//! engine.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppResult;

/// Explicit request context: the cancellation token of the inbound request
/// and the caller's bearer token. Background work runs under a detached
/// context owned by the worker supervisor; bus-delivered tasks are not
/// cancellable.
#[derive(Clone)]
pub struct RequestCtx {
    pub cancel: CancellationToken,
    pub auth_token: String,
}

impl RequestCtx {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            auth_token: auth_token.into(),
        }
    }

    /// Context for background work, never cancelled by a client disconnect.
    pub fn detached() -> Self {
        Self::new(String::new())
    }
}

/// Batched policy decisions from the external authorization engine. Keys are
/// opaque to the engine; this subsystem uses `"{project}/{environment}"`.
#[async_trait]
pub trait PolicyApi: Send + Sync {
    async fn batch_verify(
        &self,
        auth_token: &str,
        keys: &[String],
    ) -> AppResult<HashMap<String, bool>>;
}

/// Default wiring when enforcement is delegated to a gateway in front of the
/// API: every key is allowed.
pub struct PermitAllPolicy;

#[async_trait]
impl PolicyApi for PermitAllPolicy {
    async fn batch_verify(
        &self,
        _auth_token: &str,
        keys: &[String],
    ) -> AppResult<HashMap<String, bool>> {
        Ok(keys.iter().map(|k| (k.clone(), true)).collect())
    }
}

/// Policy key for an install into `(project, environment)`.
pub fn install_policy_key(project_id: i64, environment_id: i64) -> String {
    format!("{project_id}/{environment_id}")
}
