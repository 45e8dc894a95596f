//! Shared handler helpers: consistent error responses across endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::types::ErrorResponse;

/// 404 with the standard error body.
pub fn not_found(message: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new(message))).into_response()
}

/// 400 with the standard error body.
pub fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message))).into_response()
}

/// 500 that logs the full error server-side and returns a generic message,
/// so task panics and internal state never leak to API consumers.
pub fn internal_error(context: &str, err: &dyn std::fmt::Display) -> Response {
    tracing::error!(%context, error = %err, "internal server error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(format!("{context}: internal error"))),
    )
        .into_response()
}
