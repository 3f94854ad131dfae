//! Handlers for the `/jobs` resource.
//!
//! Thin adapters over [`JobGateway`](audionorm_pipeline::gateway::JobGateway).

use audionorm_core::error::CoreError;
use audionorm_core::types::DbId;
use audionorm_db::models::job::{Job, JobListQuery};
use audionorm_db::models::status::JobStatus;
use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio_util::io::ReaderStream;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Body of a `202 Accepted` submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: DbId,
}

/// Body of a successful cancellation.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: DbId,
    pub status: JobStatus,
}

/// POST /jobs
///
/// Accepts the raw audio file as the request body. Returns 202 with the new
/// job id; the job starts `pending` and is picked up by the worker pool.
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<impl IntoResponse> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::Core(CoreError::Validation(format!(
                "Audio payload must not exceed {} bytes",
                state.config.pipeline.max_upload_bytes
            )))
        } else {
            AppError::BadRequest(rejection.body_text())
        }
    })?;

    let job_id = state.gateway.submit(&body).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// GET /jobs
///
/// Newest first; filter with `?status=` and page with `?limit=&offset=`.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListQuery>,
) -> AppResult<Json<Vec<Job>>> {
    let jobs = state.gateway.list(&params).await?;
    Ok(Json(jobs))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<Json<Job>> {
    let job = state.gateway.status(job_id).await?;
    Ok(Json(job))
}

/// DELETE /jobs/{id}
///
/// Pending jobs are cancelled immediately. Running jobs are signalled and
/// report `running` until their process has been terminated.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<Json<CancelResponse>> {
    let job = state.gateway.cancel(job_id).await?;
    Ok(Json(CancelResponse {
        id: job.id,
        status: job.status,
    }))
}

/// GET /jobs/{id}/output
///
/// Streams the normalized MP3 of a succeeded job.
pub async fn download_output(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<Response> {
    let path = state.gateway.output_path(job_id).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        AppError::InternalError(format!("failed to open output of job {job_id}: {e}"))
    })?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?
        .len();
    let stream = ReaderStream::new(file);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"job-{job_id}.mp3\""),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::InternalError(e.to_string()))
}
