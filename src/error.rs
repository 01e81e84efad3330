//! Error taxonomy shared by the server and the workflow worker
//!
//! Every request-terminating failure is one of these variants. The HTTP mapping lives here too so
//! handlers can return `Result<_, RunnerError>` and let axum build the response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::warn;
use serde::Serialize;

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Missing or unusable credential
    #[error("{0}")]
    Authentication(String),
    /// Unknown dataset or environment, caller not in the access group, repository not allowed
    #[error("{0}")]
    Authorization(String),
    #[error("invalid \"{field}\": {message}")]
    Validation { field: String, message: String },
    /// The batch backend refused the job, or a waited-on job ended unsuccessfully
    #[error("{0}")]
    Dispatch(String),
    #[error("{0}")]
    Workflow(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Internal(String),
}

impl RunnerError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        RunnerError::Validation { field: field.into(), message: message.into() }
    }

    pub fn category(&self) -> &'static str {
        match self {
            RunnerError::Authentication(_) => "authentication",
            RunnerError::Authorization(_) => "authorization",
            RunnerError::Validation { .. } => "validation",
            RunnerError::Dispatch(_) => "dispatch",
            RunnerError::Workflow(_) => "workflow",
            RunnerError::Storage(_) => "storage",
            RunnerError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RunnerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            RunnerError::Authorization(_) => StatusCode::FORBIDDEN,
            RunnerError::Validation { .. } => StatusCode::BAD_REQUEST,
            RunnerError::Dispatch(_) => StatusCode::BAD_GATEWAY,
            RunnerError::Workflow(_) | RunnerError::Storage(_) | RunnerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON body returned with every error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub category: &'static str,
    pub message: String,
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("Request failed ({}): {}", status.as_u16(), self);
        let body = ErrorBody { success: false, category: self.category(), message: self.to_string() };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_names_field() {
        let err = RunnerError::validation("output", "must not be a bucket root");
        assert_eq!(err.to_string(), "invalid \"output\": must not be a bucket root");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn categories_map_to_distinct_statuses() {
        assert_eq!(RunnerError::Authentication("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RunnerError::Authorization("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(RunnerError::Dispatch("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(RunnerError::Internal("x".into()).category(), "internal");
    }
}
