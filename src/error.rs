use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failure classes for calls into the registry and the container runtime.
///
/// Retries happen inside the adapters; by the time one of these reaches the
/// controller it is final for the current tick.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_auth(&self) -> bool {
        matches!(self, AdapterError::Auth(_))
    }
}

impl From<bollard::errors::Error> for AdapterError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } if status_code < 500 => AdapterError::Fatal(format!("docker: {status_code} {message}")),
            other => AdapterError::Transient(other.to_string()),
        }
    }
}

/// Errors surfaced by the HTTP control surface.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found", self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", self.to_string()),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict", self.to_string()),
            AppError::Adapter(e) => {
                tracing::error!("adapter failure surfaced to API: {e}");
                (StatusCode::BAD_GATEWAY, "upstream_failure", e.to_string())
            }
            AppError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".to_string(),
                )
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": error, "detail": detail })),
        )
            .into_response()
    }
}
