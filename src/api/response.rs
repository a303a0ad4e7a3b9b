//! Response envelope: `{code, status, result}` on success and
//! `{code, status, errors[]}` on failure, with the HTTP status mirroring the
//! primary error class.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ApiErrorBody>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    pub code: String,
    pub user_message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(result: T) -> Self {
        ApiResponse {
            code: 200,
            status: "OK".to_string(),
            result: Some(result),
            errors: None,
        }
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        406 => "Not Acceptable",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        _ => "Internal Server Error",
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body: ApiResponse<()> = ApiResponse {
            code,
            status: status_text(code).to_string(),
            result: None,
            errors: Some(vec![ApiErrorBody {
                code: format!("{code}"),
                user_message: self.to_string(),
            }]),
        };
        body.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let ok = ApiResponse::ok(serde_json::json!({"x": 1}));
        let body = serde_json::to_value(&ok).unwrap();
        assert_eq!(body["code"], 200);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["result"]["x"], 1);
        assert!(body.get("errors").is_none());
    }

    #[test]
    fn test_status_text_classes() {
        assert_eq!(status_text(406), "Not Acceptable");
        assert_eq!(status_text(422), "Unprocessable Entity");
        assert_eq!(status_text(500), "Internal Server Error");
    }
}
