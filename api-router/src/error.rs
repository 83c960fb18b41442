use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use serde_json::{json, Value};

/// Wire-shaped API failure: `{error: {message, code, details?}}` with a
/// stable code per failure class.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
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

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            message,
        )
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(message) => Self::validation("VALIDATION_ERROR", message),
            AppError::NotFound(message) => Self::not_found(message),
            AppError::Conflict(message) => {
                Self::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            AppError::Auth(message) => {
                Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
            }
            AppError::Unavailable(message) => {
                let code = match message.as_str() {
                    "embedding_unavailable" => "EMBEDDING_UNAVAILABLE",
                    "graph_store_unavailable" => "GRAPH_STORE_UNAVAILABLE",
                    "no_backends_available" => "NO_BACKENDS_AVAILABLE",
                    _ => "SERVICE_UNAVAILABLE",
                };
                Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
            }
            AppError::BudgetExhausted(message) => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RETRY_BUDGET_EXHAUSTED",
                message,
            ),
            AppError::PartialWrite(message) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PARTIAL_WRITE",
                message,
            ),
            other => {
                tracing::error!("Internal error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "code": self.code,
                "details": self.details,
            }
        });
        (self.status, Json(body)).into_response()
    }
}
