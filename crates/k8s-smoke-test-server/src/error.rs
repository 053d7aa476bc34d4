//! Error types for the file-serving components

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for server operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request path escapes the volume mount
    #[error("rejected path {0:?}")]
    BadPath(String),

    /// Requested file does not exist on the volume
    #[error("file not found: {0}")]
    NotFound(String),

    /// The peer component's health check did not pass
    #[error("peer unhealthy: {0}")]
    PeerUnhealthy(String),

    /// Volume I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status this error is answered with
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadPath(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::PeerUnhealthy(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, "Request rejected");
        }
        (status, self.to_string()).into_response()
    }
}
