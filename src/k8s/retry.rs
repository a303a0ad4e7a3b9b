use std::future::Future;

use tracing::warn;

use crate::error::{AppError, AppResult};

const MAX_ATTEMPTS: u32 = 3;

/// Run a read-modify-write operation against a Kubernetes object, retrying
/// on resource-version conflicts. After three lost races the conflict is
/// surfaced as [`AppError::ResourceVersionConflict`].
pub async fn with_conflict_retry<T, F, Fut>(what: &str, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_conflict(&err) && attempt < MAX_ATTEMPTS => {
                warn!(what, attempt, "resource version conflict, retrying");
            }
            Err(err) if is_conflict(&err) => {
                return Err(AppError::ResourceVersionConflict(what.to_string()));
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_conflict(err: &AppError) -> bool {
    matches!(err, AppError::Kubernetes(kube::Error::Api(ae)) if ae.code == 409)
}
