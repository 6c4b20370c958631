pub mod execute;
pub mod executor_service;
pub mod schema;
pub mod state;

use axum::{extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;

use crate::error::PlaygroundError;

/// Body of every failed API response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            details: None,
        }
    }

    pub fn from_error(err: &PlaygroundError) -> Self {
        Self {
            success: false,
            error: err.to_string(),
            details: Some(format!("{:?}", err)),
        }
    }
}

pub fn error_response(status: StatusCode, body: ErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

/// Turns a malformed or missing JSON body into a 400 with a JSON envelope.
pub fn bad_body(rejection: JsonRejection) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        ErrorResponse::new(format!("Invalid request body: {}", rejection.body_text())),
    )
}

/// Returns the trimmed-nonempty value of an optional request field.
pub fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.trim().is_empty())
}
