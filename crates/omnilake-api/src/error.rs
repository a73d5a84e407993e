//! Mapping of engine errors onto HTTP responses.

use axum::{http::StatusCode, response::IntoResponse, Json};
use omnilake_core::Error;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// The archive is in a status that refuses the operation; the client
    /// may try again later.
    Busy(String),
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) | Error::Validation(msg) | Error::Reference(msg) => {
                ApiError::BadRequest(msg)
            }
            err @ Error::ArchiveBusy { .. } => ApiError::Busy(err.to_string()),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg }))
            }
            ApiError::Busy(msg) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": msg, "retryable": true }),
            ),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": err.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnilake_core::ArchiveStatus;

    fn status_of(err: Error) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(Error::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(Error::InvalidInput("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(Error::Reference("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(Error::ArchiveBusy {
                archive_id: "docs".into(),
                status: ArchiveStatus::Maintenance,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::Processing("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
