//! Operational HTTP surface: health check and sync metrics.
//!
//! The dashboard consuming these endpoints lives elsewhere; this is the
//! whole outward-facing API of the aggregator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::common::SyncTier;
use crate::domains::chapters::jobs::ImportSourceJob;
use crate::domains::series::models::{MergeReview, SeriesSource};
use crate::kernel::jobs::{Job, JobQueue, JobSpec};
use crate::kernel::scheduler::SchedulerConfig;
use crate::kernel::ServerDeps;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<ServerDeps>,
    pub scheduler_config: SchedulerConfig,
}

/// Build the application router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/sync", get(sync_metrics))
        .route("/admin/imports", post(submit_import))
        .route("/admin/dead-letters", get(list_dead_letters))
        .route("/admin/dead-letters/:id/replay", post(replay_dead_letter))
        .route("/admin/dead-letters/:id/resolve", post(resolve_dead_letter))
        .route("/admin/merge-reviews", get(list_merge_reviews))
        .route("/admin/merge-reviews/:id/resolve", post(resolve_merge_review))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Queue depth per job type, breaker state per source, dead-letter count,
/// and per-tier staleness counts.
async fn sync_metrics(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let pool = &state.deps.db_pool;

    let queue_depth: BTreeMap<String, i64> = Job::queue_depths(pool)
        .await
        .map_err(internal_error)?
        .into_iter()
        .collect();

    let dead_letter_count = Job::count_dead_letters(pool).await.map_err(internal_error)?;

    let mut staleness = BTreeMap::new();
    for tier in SyncTier::ALL {
        let count =
            SeriesSource::staleness_count(tier, state.scheduler_config.interval(tier), pool)
                .await
                .map_err(internal_error)?;
        staleness.insert(tier.as_str().to_string(), count);
    }

    let breakers: BTreeMap<String, _> = state
        .deps
        .breakers
        .snapshot()
        .into_iter()
        .collect();

    Ok(Json(json!({
        "queue_depth": queue_depth,
        "dead_letter_count": dead_letter_count,
        "staleness": staleness,
        "breakers": breakers,
    })))
}

/// Submit a newly discovered upstream entity for canonicalization and its
/// first sync. Idempotent on the upstream identity.
async fn submit_import(
    State(state): State<AppState>,
    Json(job): Json<ImportSourceJob>,
) -> Result<Json<Value>, StatusCode> {
    let spec = JobSpec::for_command(&job).map_err(internal_error)?;
    let result = state
        .deps
        .job_queue
        .enqueue(spec)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({
        "job_id": result.job_id(),
        "created": result.is_created(),
    })))
}

/// Unresolved dead letters with their payloads and attempt counts.
async fn list_dead_letters(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let jobs = Job::find_dead_letters(100, &state.deps.db_pool)
        .await
        .map_err(internal_error)?;
    let entries: Vec<Value> = jobs
        .iter()
        .map(|job| {
            json!({
                "id": job.id,
                "job_type": job.job_type,
                "args": job.args,
                "attempt": job.attempt,
                "error_message": job.error_message,
                "dead_lettered_at": job.dead_lettered_at,
                "dead_letter_reason": job.dead_letter_reason,
                "root_job_id": job.root_job_id,
            })
        })
        .collect();
    Ok(Json(json!({ "dead_letters": entries })))
}

/// Put a dead-lettered job back on the queue for another round of attempts.
async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let replayed = state
        .deps
        .job_queue
        .replay_dead_letter(id)
        .await
        .map_err(internal_error)?;
    if replayed {
        Ok(Json(json!({ "replayed": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(serde::Deserialize)]
struct ResolveDeadLetterBody {
    note: String,
}

/// Mark a dead letter as handled without replaying it.
async fn resolve_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveDeadLetterBody>,
) -> Result<Json<Value>, StatusCode> {
    let resolved = state
        .deps
        .job_queue
        .resolve_dead_letter(id, &body.note)
        .await
        .map_err(internal_error)?;
    if resolved {
        Ok(Json(json!({ "resolved": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// Open merge reviews: flagged pairs awaiting an operator decision.
async fn list_merge_reviews(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let reviews = MergeReview::find_open(100, &state.deps.db_pool)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "merge_reviews": reviews })))
}

#[derive(serde::Deserialize)]
struct ResolveReviewBody {
    resolution: String,
}

/// Close a merge review with the operator's decision text.
async fn resolve_merge_review(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveReviewBody>,
) -> Result<Json<Value>, StatusCode> {
    let resolved = MergeReview::resolve(id, &body.resolution, &state.deps.db_pool)
        .await
        .map_err(internal_error)?;
    if resolved {
        Ok(Json(json!({ "resolved": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    error!(error = %e, "metrics query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
