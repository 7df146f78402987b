//! Error types for the game API.
//!
//! [`ApiError`] wraps every failure a handler can hit and converts into an
//! Axum HTTP response via its [`IntoResponse`] implementation. Step
//! timeouts and the end of a game are not errors here; the step handler
//! reports them as a normal status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cyberrange_core::OrchestratorError;

/// Errors that can occur in the game API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The orchestrator rejected or failed the operation.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The request body is not a valid game configuration.
    #[error("invalid game configuration: {0}")]
    InvalidBody(#[from] serde_json::Error),

    /// A game id in the request path is not a UUID.
    #[error("invalid game id: {0}")]
    InvalidId(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Orchestrator(e) => match e {
                OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
                OrchestratorError::Conflict(_) | OrchestratorError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                OrchestratorError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
                OrchestratorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                OrchestratorError::Protocol { .. } => StatusCode::BAD_GATEWAY,
                OrchestratorError::Bus(_) | OrchestratorError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
                OrchestratorError::Spawn(_)
                | OrchestratorError::Supervisor(_)
                | OrchestratorError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
