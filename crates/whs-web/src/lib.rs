//! HTTP trigger surface for the sync jobs.
//!
//! The cron host authenticates with a shared bearer secret and POSTs to
//! `/jobs/{name}/run`; the JSON body and status code tell it apart whether the
//! run succeeded, was skipped on lock contention, or failed. Read endpoints
//! expose the run ledger for dashboards.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{info, warn};
use whs_core::RunStatus;
use whs_sync::{run_job_by_name, JobContext, JobOutcome, JobRegistry};

pub const CRATE_NAME: &str = "whs-web";

#[derive(Clone)]
pub struct AppState {
    pub ctx: JobContext,
    pub registry: Arc<JobRegistry>,
    pub shared_secret: String,
}

impl AppState {
    pub fn new(ctx: JobContext, registry: Arc<JobRegistry>, shared_secret: String) -> Self {
        Self {
            ctx,
            registry,
            shared_secret,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{name}/run", post(run_job_handler))
        .route("/runs", get(runs_handler))
        .route("/runs/{job}/latest", get(latest_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("WHS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Digest comparison keeps the work independent of where the strings first
/// differ. An empty configured secret never authorizes anything.
fn authorized(headers: &HeaderMap, shared_secret: &str) -> bool {
    if shared_secret.is_empty() {
        return false;
    }
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    Sha256::digest(token.as_bytes()) == Sha256::digest(shared_secret.as_bytes())
}

fn error_body(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "error": error })),
    )
        .into_response()
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({ "jobs": state.registry.names() })).into_response()
}

async fn run_job_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    // Auth is checked before the job name is even looked up; an unauthorized
    // request has no side effects and learns nothing about registered jobs.
    if !authorized(&headers, &state.shared_secret) {
        warn!(job = %name, "rejected unauthenticated trigger");
        return error_body(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    match run_job_by_name(&state.registry, &state.ctx, &name).await {
        Ok(None) => error_body(StatusCode::NOT_FOUND, "unknown job"),
        Ok(Some(JobOutcome::Skipped)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "success": false,
                "skipped": true,
                "error": "a run for this job is already in progress",
            })),
        )
            .into_response(),
        Ok(Some(JobOutcome::Completed {
            run_id,
            status,
            records_synced,
            error,
            details,
        })) => {
            if status == RunStatus::Failed {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "success": false,
                        "run_id": run_id,
                        "status": status,
                        "error": error.unwrap_or_else(|| "run failed".to_string()),
                        "details": details,
                    })),
                )
                    .into_response();
            }
            Json(serde_json::json!({
                "success": true,
                "run_id": run_id,
                "status": status,
                "records_synced": records_synced,
                "details": details,
            }))
            .into_response()
        }
        Err(err) => {
            warn!(job = %name, err = %format!("{err:#}"), "trigger failed before the job ran");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"))
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<i64>,
}

async fn runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.ctx.store.recent_runs(limit).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn latest_run_handler(
    State(state): State<Arc<AppState>>,
    Path(job): Path<String>,
) -> Response {
    match state.ctx.store.latest_run(&job).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "no runs recorded for this job"),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}
