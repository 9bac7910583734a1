use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use storyloom_core::error::LoomError;

/// Error returned by every handler, rendered as
/// `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Loom(#[from] LoomError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::Loom(e) => match e {
                LoomError::InvalidGraph(_) => (StatusCode::BAD_REQUEST, "INVALID_GRAPH"),
                LoomError::InvalidRequest(_) | LoomError::Json(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_REQUEST")
                }
                LoomError::MissingInput { .. } | LoomError::TemplateResolution { .. } => {
                    (StatusCode::BAD_REQUEST, "INVALID_INPUT")
                }
                LoomError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
                LoomError::RecipeNotFound(_) => (StatusCode::NOT_FOUND, "RECIPE_NOT_FOUND"),
                LoomError::ExecutionNotFound(_) => (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND"),
                LoomError::NodeNotFound { .. } => (StatusCode::NOT_FOUND, "NODE_NOT_FOUND"),
                LoomError::RecipeInactive(_) => (StatusCode::CONFLICT, "RECIPE_INACTIVE"),
                LoomError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
                LoomError::LlmRequest(_)
                | LoomError::LlmParse(_)
                | LoomError::UnsupportedProvider(_) => (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(code, error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                ApiError::Loom(LoomError::InvalidGraph("cycle detected".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Loom(LoomError::ExecutionNotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Loom(LoomError::InvalidState("done".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::Loom(LoomError::LlmRequest("HTTP 500".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::Loom(LoomError::Database("locked".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
