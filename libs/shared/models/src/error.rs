use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// HTTP-facing error. Cell services return their own error enums with
/// stable machine codes; handlers convert those into one of these variants
/// so every rejection reaches the caller as `{ "error": ..., "code": ... }`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Policy violation: {message}")]
    PolicyViolation { code: &'static str, message: String },

    #[error("Conflict: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "validation",
            AppError::PolicyViolation { code, .. } => code,
            AppError::Conflict { code, .. } => code,
            AppError::Internal(_) => "internal",
            AppError::Database(_) => "database",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PolicyViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!("Error: {}: {}", status, self);

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
