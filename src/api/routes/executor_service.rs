use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use super::state::ExecutorState;
use super::{bad_body, error_response, required, ErrorResponse};
use crate::executor::RemoteExecuteRequest;

/// POST /execute on the stand-alone C# execution service
pub async fn execute(
    State(state): State<ExecutorState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let Json(value) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let code = serde_json::from_value::<RemoteExecuteRequest>(value)
        .ok()
        .and_then(|request| required(Some(request.code)));
    let Some(code) = code else {
        return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Code is required"));
    };

    Json(state.runner.execute(&code).await).into_response()
}
