//! Job handlers: enqueue a reel download and poll its status.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use validator::{Validate, ValidationErrors};

use reel_models::{Job, JobId, JobStatus};
use reel_store::JobRecord;

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::security::{is_valid_job_id, validate_reel_url};
use crate::state::AppState;

/// Request to download a reel.
#[derive(Debug, Deserialize, Validate)]
pub struct EnqueueJobRequest {
    #[validate(
        length(min = 1, max = 2048, message = "url must be between 1 and 2048 characters"),
        url(message = "url must be a well-formed URL")
    )]
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Job status response.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub source_url: String,
    /// Failed deliveries so far
    pub attempts: u32,
    /// Strategy that produced the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set while a retry is scheduled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            status: job.status,
            source_url: job.source_url.clone(),
            attempts: job.attempts,
            method: job.method.map(|m| m.as_str().to_string()),
            error: job.error.clone(),
            size_bytes: job.artifact.as_ref().map(|a| a.size_bytes),
            elapsed_ms: job.artifact.as_ref().map(|a| a.elapsed_ms),
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
            next_attempt_at: job.next_attempt_at,
        }
    }
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id.to_string(),
            status: record.status,
            source_url: record.source_url,
            attempts: record.attempts,
            method: record.method.map(|m| m.as_str().to_string()),
            error: record.error,
            size_bytes: record.size_bytes,
            elapsed_ms: record.elapsed_ms,
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
            next_attempt_at: None,
        }
    }
}

fn validation_messages(errors: &ValidationErrors) -> Vec<String> {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(msg) => msg.to_string(),
                None => format!("{} is invalid ({})", field, e.code),
            })
        })
        .collect();
    messages.sort();
    messages
}

/// Enqueue a reel download.
///
/// Returns 202 with the job ID; the job is `queued` until a worker picks it up.
pub async fn enqueue_job(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<EnqueueJobResponse>)> {
    let Json(request) = payload.map_err(|rejection| ApiError::validation(rejection.body_text()))?;

    request
        .validate()
        .map_err(|e| ApiError::Validation(validation_messages(&e)))?;

    let url = validate_reel_url(&request.url).map_err(|e| ApiError::validation(e.to_string()))?;

    let job = Job::new(url);

    // Written before the job is visible to workers, so a fast worker's
    // terminal record can never be overwritten by this one. The queue is
    // the source of truth; the store copy is best effort.
    if let Err(e) = state.store.save(&job).await {
        warn!(job_id = %job.id, error = %e, "Failed to persist queued job record");
    }

    let job_id = state.queue.enqueue(job.clone()).await?;

    metrics::record_job_enqueued();
    info!(job_id = %job_id, source_url = %job.source_url, "Job enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueJobResponse {
            job_id: job_id.to_string(),
            status: JobStatus::Queued,
        }),
    ))
}

/// Get job status.
///
/// Falls back to the persisted record once the queue has expired the job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    if !is_valid_job_id(&job_id) {
        return Err(ApiError::not_found("Job not found"));
    }
    let job_id = JobId::from_string(job_id);

    if let Some(job) = state.queue.get(&job_id).await? {
        return Ok(Json(JobStatusResponse::from(&job)));
    }

    match state.store.load(&job_id).await {
        Ok(Some(record)) => Ok(Json(JobStatusResponse::from(record))),
        Ok(None) => Err(ApiError::not_found("Job not found")),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Job record lookup failed");
            Err(ApiError::Unavailable(format!("job record lookup: {}", e)))
        }
    }
}
