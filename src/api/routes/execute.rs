use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use super::state::AppState;
use super::{bad_body, error_response, required, ErrorResponse};
use crate::executor::{Language, SqlOutcome};

/// Request body for POST /api/execute-sql
#[derive(Debug, Default, Deserialize)]
pub struct SqlRequest {
    pub query: Option<String>,
}

/// Request body for the per-language code endpoints
#[derive(Debug, Default, Deserialize)]
pub struct CodeRequest {
    pub code: Option<String>,
}

/// Request body for POST /api/execute
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    pub language: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SqlResponse {
    pub success: bool,
    pub data: SqlOutcome,
}

/// POST /api/execute-sql
///
/// Runs one SQL statement (or batch) against the playground database
pub async fn execute_sql(
    State(state): State<AppState>,
    body: Result<Json<SqlRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(query) = required(request.query) else {
        return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Query is required"));
    };

    debug!("Executing SQL query ({} chars)", query.len());
    match state.gateway.execute_sql(&query).await {
        Ok(data) => Json(SqlResponse { success: true, data }).into_response(),
        Err(e) => {
            error!("Database query error: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::from_error(&e))
        }
    }
}

/// POST /api/execute-javascript
pub async fn execute_javascript(
    State(state): State<AppState>,
    body: Result<Json<CodeRequest>, JsonRejection>,
) -> Response {
    run_code(state, Language::JavaScript, body).await
}

/// POST /api/execute-csharp
///
/// Compiles on first sight of a source text, then serves it from the
/// artifact cache
pub async fn execute_csharp(
    State(state): State<AppState>,
    body: Result<Json<CodeRequest>, JsonRejection>,
) -> Response {
    run_code(state, Language::CSharp, body).await
}

/// POST /api/execute
///
/// Uniform entry point: `{language, code}` for any supported language
pub async fn execute(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(language) = required(request.language) else {
        return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Language is required"));
    };
    let language = match language.parse::<Language>() {
        Ok(language) => language,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new(e.to_string())),
    };
    let Some(code) = required(request.code) else {
        return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Code is required"));
    };

    Json(state.gateway.execute(language, &code).await).into_response()
}

async fn run_code(
    state: AppState,
    language: Language,
    body: Result<Json<CodeRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let Some(code) = required(request.code) else {
        return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Code is required"));
    };

    debug!("Executing {} code ({} chars)", language, code.len());
    Json(state.gateway.execute(language, &code).await).into_response()
}
