//! API error envelope: every failure leaves the service as a structured
//! `{code, message}` body with a matching HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::FailedPrecondition(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        let body = Json(serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<scribe_store::StoreError> for ApiError {
    fn from(e: scribe_store::StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<scribe_catalog::CatalogError> for ApiError {
    fn from(e: scribe_catalog::CatalogError) -> Self {
        ApiError::NotFound(e.to_string())
    }
}

impl From<scribe_models::ModelError> for ApiError {
    fn from(e: scribe_models::ModelError) -> Self {
        match e {
            scribe_models::ModelError::Catalog(c) => ApiError::NotFound(c.to_string()),
            scribe_models::ModelError::DownloadInProgress(m) => {
                ApiError::FailedPrecondition(format!("download already in progress for {m}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
