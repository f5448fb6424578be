//! Download routes: submit, poll and cancel.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::api::signed;
use crate::domain::{JobId, JobState, ResultRef};
use crate::pipeline::{CancelAck, SubmitOutcome, SubmitRequest};
use crate::poller::JobStatus;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit))
        .route("/signed", post(submit_signed))
        .route("/{job_id}", get(poll).delete(cancel))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
}

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub data: String,
    pub sig: String,
}

fn into_response(outcome: SubmitOutcome) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let (code, status, duplicate) = match &outcome {
        SubmitOutcome::Started(_) => (StatusCode::ACCEPTED, "started", false),
        SubmitOutcome::Queued(_) => (StatusCode::ACCEPTED, "queued", false),
        SubmitOutcome::Duplicate(job) => (StatusCode::OK, job_label(job.state), true),
        SubmitOutcome::Ready(_) => (StatusCode::OK, "ready", false),
        SubmitOutcome::LimitExceeded { user_limit, active } => {
            return Err(ApiError::limit_reached(*user_limit, *active));
        }
    };
    let Some(job) = outcome.job() else {
        return Err(ApiError::internal("submit produced no job"));
    };
    Ok((
        code,
        Json(SubmitResponse {
            job_id: job.id.clone(),
            status: status.to_string(),
            queue_position: job.queue_position,
            duplicate,
            result: job.result_ref.clone(),
        }),
    ))
}

fn job_label(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Ready => "ready",
        JobState::Failed => "failed",
        JobState::Expired => "expired",
        _ => "processing",
    }
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let outcome = state.pipeline.submit(request).await?;
    into_response(outcome)
}

async fn submit_signed(
    State(state): State<AppState>,
    Query(query): Query<SignedQuery>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Some(secret) = state.download_secret.as_deref() else {
        return Err(ApiError::forbidden("signed requests are disabled"));
    };
    let request = signed::verify(secret, &query.data, &query.sig, Utc::now()).map_err(|e| {
        warn!(error = %e, "Rejected signed submit");
        ApiError::from(e)
    })?;
    debug!(user_id = request.user_id, "Signed submit verified");
    let outcome = state.pipeline.submit(request).await?;
    into_response(outcome)
}

async fn poll(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    let job_id = JobId::from(job_id);
    state
        .pipeline
        .poll(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job '{}' not found", job_id)))
}

async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelAck>> {
    let ack = state.pipeline.cancel(&JobId::from(job_id))?;
    Ok(Json(ack))
}
