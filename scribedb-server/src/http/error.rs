//! API error types with IntoResponse
//!
//! Every flavor of "the database cannot be used right now" collapses into one
//! 503 with a retry hint. Details go to the log, never to the client.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use scribedb_pool::DbError;

/// Seconds clients are told to wait before retrying
pub const RETRY_AFTER_SECS: u64 = 5;

pub const UNAVAILABLE_MESSAGE: &str = "database temporarily unavailable, try again";

#[derive(Debug)]
pub enum ApiError {
    /// Database unreachable (503, logged)
    Unavailable { reason: String },

    /// Malformed request (400)
    BadRequest { message: String },

    /// Statement failed (500, logged)
    Database(DbError),
}

impl ApiError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Unavailable { reason } => {
                tracing::warn!(reason = %reason, "database unavailable");
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": "database_unavailable",
                        "message": UNAVAILABLE_MESSAGE
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
                return response;
            }
            Self::BadRequest { message } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "bad_request",
                    "message": message
                }),
            ),
            Self::Database(e) => {
                tracing::error!(kind = e.kind(), "Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": "internal_error",
                        "message": "an internal error occurred"
                    }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Query(_) => Self::Database(e),
            // Configuration gaps, refused sockets and deadlines all look the
            // same to the client
            other => Self::Unavailable {
                reason: format!("{} ({})", other, other.kind()),
            },
        }
    }
}
