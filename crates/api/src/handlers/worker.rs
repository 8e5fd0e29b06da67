//! Worker protocol.
//!
//! State-changing calls answer `{"updated": false}` rather than an error when
//! the job is no longer processing on the calling worker; the worker is
//! expected to drop the job.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use db::models::ExecutionLogEntry;
use pipeline::MarkOpts;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DequeueRequest {
    pub worker_hostname: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_hostname: String,
    #[serde(default)]
    pub job_ids: Vec<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Ids the worker still owns.
    pub known_ids: Vec<i64>,
    /// Owned ids that were flagged for cancellation.
    pub cancel_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogEntryRequest {
    pub worker_hostname: String,
    pub entry: ExecutionLogEntry,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntryResponse {
    pub index: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct FailureRequest {
    pub worker_hostname: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdatedResponse {
    pub updated: bool,
}

/// `200` with the claimed job, or `204` when the queue is empty.
pub async fn dequeue(State(state): State<AppState>, Json(req): Json<DequeueRequest>) -> ApiResult<Response> {
    Ok(match state.controller.dequeue(&req.worker_hostname).await? {
        Some(job) => Json(job).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let known_ids = state.controller.heartbeat(&req.worker_hostname, &req.job_ids).await?;
    let cancel_ids = state.controller.fetch_canceled(&req.worker_hostname).await?;
    Ok(Json(HeartbeatResponse { known_ids, cancel_ids }))
}

pub async fn add_log_entry(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(req): Json<LogEntryRequest>,
) -> ApiResult<Json<LogEntryResponse>> {
    let opts = MarkOpts::worker(req.worker_hostname);
    let index = state.controller.add_execution_log_entry(id, &opts, &req.entry).await?;
    Ok(Json(LogEntryResponse { index }))
}

pub async fn complete(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(opts): Json<MarkOpts>,
) -> ApiResult<Json<UpdatedResponse>> {
    let updated = state.controller.mark_complete(id, &opts).await?;
    Ok(Json(UpdatedResponse { updated }))
}

pub async fn fail(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(req): Json<FailureRequest>,
) -> ApiResult<Json<UpdatedResponse>> {
    let updated = state.controller.mark_failed(id, &req.message, &MarkOpts::worker(req.worker_hostname)).await?;
    Ok(Json(UpdatedResponse { updated }))
}

pub async fn error(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(req): Json<FailureRequest>,
) -> ApiResult<Json<UpdatedResponse>> {
    let updated = state.controller.mark_errored(id, &req.message, &MarkOpts::worker(req.worker_hostname)).await?;
    Ok(Json(UpdatedResponse { updated }))
}

pub async fn canceled(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(opts): Json<MarkOpts>,
) -> ApiResult<Json<UpdatedResponse>> {
    let updated = state.controller.mark_canceled(id, &opts).await?;
    Ok(Json(UpdatedResponse { updated }))
}
