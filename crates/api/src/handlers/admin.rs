use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use db::models::{JobRow, JobState};
use db::repository::queue::ListJobsOpts;
use pipeline::{CancelOpts, RetryOpts};

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SkippedResponse {
    pub skipped: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListJobsQuery {
    pub batch_spec_id: Option<i64>,
    pub state: Option<JobState>,
    pub with_rank: bool,
}

pub async fn create_jobs(
    Path(batch_spec_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Vec<JobRow>>)> {
    let jobs = state.controller.create_jobs(batch_spec_id).await?;
    Ok((StatusCode::CREATED, Json(jobs)))
}

pub async fn mark_skipped(
    Path(batch_spec_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResult<Json<SkippedResponse>> {
    let skipped = state.controller.mark_skipped_workspaces(batch_spec_id).await?;
    Ok(Json(SkippedResponse { skipped }))
}

/// Blocks until no job of the batch spec is processing, or the cancel deadline passes.
pub async fn cancel_batch_spec(
    Path(batch_spec_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<JobRow>>> {
    Ok(Json(state.controller.cancel_and_wait(batch_spec_id).await?))
}

pub async fn cancel_jobs(
    State(state): State<AppState>,
    Json(opts): Json<CancelOpts>,
) -> ApiResult<Json<Vec<JobRow>>> {
    Ok(Json(state.controller.cancel_jobs(&opts).await?))
}

pub async fn retry_jobs(
    State(state): State<AppState>,
    Json(opts): Json<RetryOpts>,
) -> ApiResult<Json<Vec<JobRow>>> {
    Ok(Json(state.controller.retry_jobs(&opts).await?))
}

pub async fn list_jobs(
    Query(query): Query<ListJobsQuery>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<JobRow>>> {
    let opts = ListJobsOpts {
        batch_spec_id: query.batch_spec_id,
        states: query.state.into_iter().collect(),
        ids: Vec::new(),
        with_rank: query.with_rank,
    };
    Ok(Json(state.controller.list_jobs(&opts).await?))
}

pub async fn get_job(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult<Json<JobRow>> {
    Ok(Json(state.controller.get_job(id).await?))
}

pub async fn get_job_by_workspace(
    Path(workspace_id): Path<i64>,
    State(state): State<AppState>,
) -> ApiResult<Json<JobRow>> {
    Ok(Json(state.controller.get_job_by_workspace(workspace_id).await?))
}
