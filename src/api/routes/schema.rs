use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde::Serialize;

use super::state::AppState;
use super::{error_response, ErrorResponse};
use crate::database::SchemaDescription;
use crate::migration::MigrationRecord;

#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub success: bool,
    pub schema: SchemaDescription,
}

#[derive(Debug, Serialize)]
pub struct MigrationsResponse {
    pub success: bool,
    pub migrations: Vec<MigrationRecord>,
}

/// GET /api/schema
///
/// Lists every user table with its columns in declaration order
pub async fn get_schema(State(state): State<AppState>) -> Response {
    match state.gateway.sql().describe_schema().await {
        Ok(schema) => Json(SchemaResponse {
            success: true,
            schema,
        })
        .into_response(),
        Err(e) => {
            error!("Schema fetch error: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::from_error(&e))
        }
    }
}

/// GET /api/migrations
///
/// Returns the migration ledger, ordered by version
pub async fn get_migrations(State(state): State<AppState>) -> Response {
    match state.gateway.sql().applied_migrations().await {
        Ok(migrations) => Json(MigrationsResponse {
            success: true,
            migrations,
        })
        .into_response(),
        Err(e) => {
            error!("Failed to read migration ledger: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::from_error(&e))
        }
    }
}
