//! HTTP request handlers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::instrument;

use crate::context::Submission;
use crate::pipeline::EvalResponse;

use super::AppState;
use super::auth::verify_token;

/// Canonical rejection for a bad or missing bearer token.
fn unauthorized() -> Response {
    let body = json!({
        "data": [],
        "statusCode": 418,
        "duration": 0,
        "errors": [{"message": "not today my little bish xqcL"}],
    });
    (StatusCode::IM_A_TEAPOT, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// `POST /eval`: evaluate a snippet.
#[instrument(skip_all)]
pub async fn eval_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = bearer_token(&headers).unwrap_or_default();
    if !verify_token(&state.settings.auth, token) {
        return unauthorized();
    }

    let submission: Submission = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(_) => {
            let response = EvalResponse::error(400, "body must be a JSON object", 0.0);
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let response = state
        .pipeline
        .submit(&submission.code, submission.msg.as_ref())
        .await;

    tracing::debug!(
        status = response.status_code,
        duration_ms = response.duration,
        "Evaluation finished"
    );

    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response)).into_response()
}

/// `GET /health`: pool readiness and counters.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.pool.stats();
    let status = if stats.ready > 0 { "ok" } else { "starting" };
    Json(json!({
        "status": status,
        "workers": stats,
        "socketClients": state.hub.has_clients(),
    }))
    .into_response()
}
