//! Thin inbound HTTP adapter. Handlers decode, build the request context,
//! call the service layer and wrap the outcome in the response envelope.

pub mod chart_repos;
pub mod groups;
pub mod installed_apps;
pub mod migration;
pub mod response;

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::auth::RequestCtx;
use crate::service::{BulkService, ChartRepoService, InstallService, MigrationService};

#[derive(Clone)]
pub struct AppState {
    pub install: Arc<InstallService>,
    pub bulk: Arc<BulkService>,
    pub migration: Arc<MigrationService>,
    pub chart_repos: Arc<ChartRepoService>,
}

/// Request context from the inbound headers. The cancellation token is
/// dropped (and thereby cancelled) when the connection goes away with the
/// handler future.
pub fn request_ctx(headers: &HeaderMap) -> RequestCtx {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string())
        .unwrap_or_default();
    RequestCtx::new(token)
}

/// Parse a comma-separated id list query parameter.
pub(crate) fn parse_id_list(raw: &Option<String>) -> Vec<i64> {
    raw.as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list(&Some("1,2, 3".into())), vec![1, 2, 3]);
        assert_eq!(parse_id_list(&Some("".into())), Vec::<i64>::new());
        assert_eq!(parse_id_list(&None), Vec::<i64>::new());
        assert_eq!(parse_id_list(&Some("1,x,3".into())), vec![1, 3]);
    }

    #[test]
    fn test_request_ctx_strips_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer token123".parse().unwrap(),
        );
        let ctx = request_ctx(&headers);
        assert_eq!(ctx.auth_token, "token123");
    }
}
