use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{ApiError, WebState};
use crate::core::{Job, NodeStatus, Operation, RunTestsArgs, node_status};

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub result: &'static str,
    pub job_id: String,
}

/// `GET /status`. Always answers; an unreachable queue yields an unknown status.
pub async fn status(State(state): State<WebState>) -> Json<NodeStatus> {
    Json(node_status(&state.ctx.queue, state.ctx.config.node_name()).await)
}

/// `POST /run-test`. Validates the request and queues the run; does not wait
/// for it.
pub async fn run_test(
    State(state): State<WebState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Accepted>, ApiError> {
    let commit_sha = parse_commit_sha(&headers, &body)?;

    let handle = state
        .ctx
        .queue
        .enqueue(Operation::RunTests, &RunTestsArgs { commit_sha: commit_sha.clone() })
        .await?;

    info!(job_id = %handle.id, commit_sha = %commit_sha, "Test run accepted");
    Ok(Json(Accepted {
        result: "success",
        job_id: handle.id,
    }))
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// `GET /jobs/{id}`.
pub async fn job(
    State(state): State<WebState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.ctx.queue.get(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::JobNotFound(id)),
    }
}

/// The body must be a JSON object (declared as JSON) with a non-empty
/// string `commit_sha`.
fn parse_commit_sha(headers: &HeaderMap, body: &[u8]) -> Result<String, ApiError> {
    if !is_json(headers) {
        return Err(ApiError::InvalidPayload);
    }

    let payload: Value = serde_json::from_slice(body).map_err(|_| ApiError::InvalidPayload)?;
    let Value::Object(fields) = payload else {
        return Err(ApiError::InvalidPayload);
    };

    match fields.get("commit_sha").and_then(Value::as_str).map(str::trim) {
        Some(sha) if !sha.is_empty() => Ok(sha.to_string()),
        _ => Err(ApiError::MissingField("commit_sha")),
    }
}

/// `application/json` or any `application/*+json` media type.
fn is_json(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };

    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    mime == "application/json" || (mime.starts_with("application/") && mime.ends_with("+json"))
}
