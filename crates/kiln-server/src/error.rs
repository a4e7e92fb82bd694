//! Error types for the Kiln server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use kiln_core::StoreError;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Kiln core error.
    #[error("{0}")]
    Core(#[from] kiln_core::Error),

    /// Function or record store error.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Malformed request parameters.
    #[error("{0}")]
    BadRequest(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServerError::Store(StoreError::AlreadyExists(_)) => StatusCode::CONFLICT,
            ServerError::Store(StoreError::Invalid(_)) | ServerError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Core(
                kiln_core::Error::InvalidSubmission(_) | kiln_core::Error::UnsupportedLanguage(_),
            ) => StatusCode::BAD_REQUEST,
            ServerError::Core(kiln_core::Error::BackendUnavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
