//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use screenflow_core::WorkflowError;

/// Error returned by gateway handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    /// Malformed body, path or query before reaching the engine.
    #[error("{0}")]
    BadInput(String),

    #[error("{0}")]
    UnknownRoute(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Workflow(e) => match e {
                WorkflowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
                WorkflowError::Conflict(_) => StatusCode::CONFLICT,
                WorkflowError::Authorization(_) => StatusCode::FORBIDDEN,
                WorkflowError::Store(_) | WorkflowError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UnknownRoute(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Workflow(e) => e.error_kind(),
            Self::Unauthorized => "unauthorized",
            Self::BadInput(_) => "validation_error",
            Self::UnknownRoute(_) => "not_found",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Infrastructure detail stays in the logs.
            Self::Workflow(e) if !e.is_client_error() => {
                error!(error = %e, "request failed");
                "internal server error".to_string()
            }
            Self::Unauthorized => {
                warn!("rejected unauthenticated request");
                self.to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
