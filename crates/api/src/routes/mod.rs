//! HTTP route handlers

pub mod about;
pub mod obd;

use axum::{http::StatusCode, http::Uri, Json};
use serde::Serialize;

/// Body of error responses
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Fallback for unknown routes
pub async fn not_found(uri: Uri) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Not Found (404) - {}", uri.path()),
        }),
    )
}
