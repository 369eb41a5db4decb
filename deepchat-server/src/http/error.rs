use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use shared::{llm::LlmError, models::ErrorResponse};
use thiserror::Error;

use crate::services::chat_store::ChatStoreError;

pub type AppResult<T> = Result<T, ApiError>;

/// API-boundary error. Renders as `{ "error": message }` plus optional
/// diagnostic `details` for operators.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthenticated", "Unauthorized")
    }

    /// Ownership violation. Deliberately indistinguishable from the
    /// unauthenticated response so resource existence does not leak.
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "request failed");
        } else {
            tracing::debug!(code = self.code, message = %self.message, "request rejected");
        }

        let mut body = ErrorResponse::new(self.message);
        if let Some(details) = self.details {
            body = body.with_details(details);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<ChatStoreError> for ApiError {
    fn from(err: ChatStoreError) -> Self {
        match err {
            ChatStoreError::NotFound(message) => Self::not_found(message),
            ChatStoreError::Database(db_err) => {
                Self::internal_server_error("An error occurred while processing your request")
                    .with_details(json!({ "cause": db_err.to_string() }))
            }
        }
    }
}

impl From<LlmError> for ApiError {
    fn from(err: LlmError) -> Self {
        // Setup-phase provider faults are reported like bad input, with the
        // diagnostic kept in details (never as a distinct client-facing type).
        Self::invalid_input("Unknown error occurred")
            .with_details(json!({ "cause": err.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn error_body_carries_error_field() {
        let response = ApiError::invalid_input("Missing required field: id").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Missing required field: id");
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn store_errors_map_to_generic_500_with_details() {
        let err = ApiError::from(ChatStoreError::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);

        let response = err.into_response();
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body["error"],
            "An error occurred while processing your request"
        );
        assert!(body["details"]["cause"].is_string());
    }

    #[test]
    fn ownership_and_session_failures_share_a_response_shape() {
        let a = ApiError::unauthenticated();
        let b = ApiError::unauthorized();
        assert_eq!(a.status, b.status);
        assert_eq!(a.message, b.message);
    }

    #[test]
    fn llm_errors_surface_as_invalid_input() {
        let err = ApiError::from(LlmError::Protocol("truncated".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.details.is_some());
    }
}
