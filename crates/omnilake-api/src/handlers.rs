//! HTTP handlers. Each one is a thin adapter over a [`LakeService`]
//! operation.
//!
//! [`LakeService`]: omnilake_jobs::LakeService

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use omnilake_core::{
    Archive, ChainDescription, ChainSubmitted, CreateArchiveRequest, Entry, Job, JobType,
    LakeRequestBody, LakeRequestDescription, LakeRequestSubmitted, Source,
};
use omnilake_jobs::{AddEntryRequest, ChainSubmission};
use tracing::info;
use uuid::Uuid;

use crate::{ApiError, AppState};

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// LAKE REQUESTS
// =============================================================================

/// Submit a standalone lake request.
///
/// # Returns
/// - 201 Created with `{lake_request_id, job_id, job_type}`
/// - 400 Bad Request if the body fails validation or carries `REF:` tokens
pub async fn submit_lake_request(
    State(state): State<AppState>,
    Json(body): Json<LakeRequestBody>,
) -> Result<(StatusCode, Json<LakeRequestSubmitted>), ApiError> {
    let submitted = state.service.submit_lake_request(body).await?;
    info!(lake_request_id = %submitted.lake_request_id, "Lake request submitted");
    Ok((StatusCode::CREATED, Json(submitted)))
}

pub async fn describe_lake_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LakeRequestDescription>, ApiError> {
    Ok(Json(state.service.describe_lake_request(id).await?))
}

// =============================================================================
// CHAINS
// =============================================================================

/// Submit a chain.
///
/// # Returns
/// - 201 Created with `{chain_request_id, job_id, job_type}`
/// - 400 Bad Request on duplicate names, forward references or unknown steps
pub async fn submit_chain_request(
    State(state): State<AppState>,
    Json(submission): Json<ChainSubmission>,
) -> Result<(StatusCode, Json<ChainSubmitted>), ApiError> {
    let submitted = state.service.submit_chain_request(submission).await?;
    info!(chain_request_id = %submitted.chain_request_id, "Chain submitted");
    Ok((StatusCode::CREATED, Json(submitted)))
}

pub async fn describe_chain_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChainDescription>, ApiError> {
    Ok(Json(state.service.describe_chain_request(id).await?))
}

// =============================================================================
// JOBS
// =============================================================================

pub async fn describe_job(
    State(state): State<AppState>,
    Path((job_type, job_id)): Path<(String, Uuid)>,
) -> Result<Json<Job>, ApiError> {
    let job_type: JobType = job_type.parse()?;
    Ok(Json(state.service.describe_job(job_type, job_id).await?))
}

// =============================================================================
// ARCHIVES
// =============================================================================

pub async fn create_archive(
    State(state): State<AppState>,
    Json(request): Json<CreateArchiveRequest>,
) -> Result<(StatusCode, Json<Archive>), ApiError> {
    let archive = state.service.create_archive(request).await?;
    Ok((StatusCode::CREATED, Json(archive)))
}

pub async fn describe_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Archive>, ApiError> {
    Ok(Json(state.service.describe_archive(&id).await?))
}

/// Mark an archive DELETING.
///
/// # Returns
/// - 200 OK with the archive
/// - 409 Conflict with `retryable: true` while the archive is in maintenance
pub async fn delete_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Archive>, ApiError> {
    Ok(Json(state.service.delete_archive(&id).await?))
}

/// Queue a VACUUM job; returns 202 with the job to poll.
pub async fn vacuum_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.service.vacuum_archive(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Queue a REINDEX job; returns 202 with the job to poll.
pub async fn reindex_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.service.reindex_archive(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

// =============================================================================
// ENTRIES AND SOURCES
// =============================================================================

pub async fn add_entry(
    State(state): State<AppState>,
    Json(request): Json<AddEntryRequest>,
) -> Result<(StatusCode, Json<Entry>), ApiError> {
    let entry = state.service.add_entry(request).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Entry>, ApiError> {
    Ok(Json(state.service.get_entry(id).await?))
}

pub async fn put_source(
    State(state): State<AppState>,
    Json(source): Json<Source>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.service.put_source(source).await?))
}
