//! HTTP entry point in the shape of a serverless job runtime.
//!
//! `POST /runsync` runs one job to completion and answers with its output;
//! job failures are reported in the body with HTTP 200. `GET /health`
//! reports whether ComfyUI currently answers its liveness probe.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use comfyjob_core::job::{Job, JobOutput};

use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on process shutdown; in-flight jobs observe it.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    /// `COMPLETED` or `FAILED`.
    pub status: &'static str,
    pub output: JobOutput,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub comfyui_ready: bool,
}

/// POST /runsync
async fn run_sync(State(state): State<AppState>, Json(mut job): Json<Job>) -> Json<RunResponse> {
    let id = job
        .id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();

    let output = state.orchestrator.handle(&job, &state.shutdown).await;
    let status = if output.is_success() {
        "COMPLETED"
    } else {
        "FAILED"
    };

    Json(RunResponse { id, status, output })
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let comfyui_ready = matches!(state.orchestrator.api().ping().await, Ok(true));

    Json(HealthResponse {
        status: if comfyui_ready { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        comfyui_ready,
    })
}

/// Build the router with its middleware stack.
pub fn router(state: AppState) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/runsync", post(run_sync))
        .route("/health", get(health_check))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(state)
}
