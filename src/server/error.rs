use crate::core::error::OrchestratorError;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

/// Every failed API call renders as `{status:"error", message, error_type}`.
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(OrchestratorError::validation(e.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self(OrchestratorError::validation(e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error_type = self.0.error_type(), "{}", self.0);
        }
        let body = json!({
            "status": "error",
            "message": self.0.to_string(),
            "error_type": self.0.error_type(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_error_kinds_to_http_status() {
        assert_eq!(ApiError(OrchestratorError::validation("x")).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError(OrchestratorError::not_found("x")).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError(OrchestratorError::Server("x".into())).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
