//! API error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use orthos_api::responses::ErrorResponse;
use orthos_client::ClientError;
use orthos_core::CoreError;

/// Error body plus the status it is sent with
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub error: ErrorResponse,
}

impl AppError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl From<CoreError> for AppError {
    fn from(error: CoreError) -> Self {
        let message = error.to_string();
        match error {
            CoreError::Validation(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED", message)
            }
            CoreError::Conflict(_) | CoreError::MachineExists(_) => {
                Self::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            CoreError::MachineNotFound(_) | CoreError::TaskNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
            }
            CoreError::InvalidTransition { .. }
            | CoreError::ActorError(_)
            | CoreError::Persistence(_)
            | CoreError::Config(_) => {
                tracing::error!(error = %message, "Request failed");
                Self::internal(message)
            }
        }
    }
}

/// Taskmanager answers pass through with their status and code
impl From<ClientError> for AppError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Api {
                status,
                code,
                message,
            } => Self::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                &code,
                message,
            ),
            other => {
                tracing::error!(error = %other, "Taskmanager request failed");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "TASKMANAGER_UNAVAILABLE",
                    other.to_string(),
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}
