// SPDX-License-Identifier: MIT OR Apache-2.0

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use pelican_core::ErrorCode;
use pelican_store::StoreError;

/// Error body returned by every failing Action API handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    /// A required field is missing or malformed.
    #[error("{0}")]
    Validation(String),

    /// The idempotency key was already used for a different target.
    #[error("idempotency key already used for a different target")]
    IdempotencyConflict,

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The referenced session is closed or outside its check-in window.
    #[error("session check-in window has passed")]
    SessionExpired,

    /// The storage backend failed.
    #[error("internal storage error")]
    Internal(#[source] StoreError),
}

impl ApiError {
    /// Shorthand for a missing-field validation error.
    pub fn missing(field: &str) -> Self {
        ApiError::Validation(format!("missing required field: {field}"))
    }

    fn code(&self) -> ErrorCode {
        match self {
            ApiError::Validation(_) => ErrorCode::Validation,
            ApiError::IdempotencyConflict => ErrorCode::IdempotencyConflict,
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::SessionExpired => ErrorCode::SessionExpired,
            ApiError::Internal(_) => ErrorCode::Internal,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::IdempotencyConflict => StatusCode::CONFLICT,
            ApiError::NotFound(_) | ApiError::SessionExpired => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IdempotencyConflict(_) => ApiError::IdempotencyConflict,
            StoreError::SessionNotFound(id) => {
                ApiError::NotFound(format!("no attendance session with id {id}"))
            }
            StoreError::SessionTransition(err) => ApiError::Validation(err.to_string()),
            err @ StoreError::Backend(_) => ApiError::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            error!("storage backend failure: {err}");
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use pelican_core::IdempotencyKey;
    use pelican_store::StoreError;

    use super::ApiError;

    #[test]
    fn store_errors_map_to_wire_errors() {
        let conflict: ApiError = StoreError::IdempotencyConflict(IdempotencyKey::new()).into();
        assert_eq!(
            conflict.into_response().status(),
            StatusCode::CONFLICT
        );

        let missing = ApiError::missing("uid");
        assert_eq!(
            missing.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
