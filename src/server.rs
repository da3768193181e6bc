//! HTTP surface of the worker
//!
//! `POST /run`, `/rpc` and `/runsync` accept a job envelope
//! (`{"input": {"image": ..., "mask": ...}}`) and answer with the pipeline's
//! response envelope. Malformed JSON is rejected before it reaches the
//! pipeline; anything that goes wrong inside it comes back as a
//! `{"status": "error"}` body.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, MatchedPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointReport;
use crate::metrics;
use crate::pipeline::InpaintPipeline;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<InpaintPipeline>,
    pub checkpoint: Option<Arc<CheckpointReport>>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline: Arc<InpaintPipeline>, checkpoint: Option<CheckpointReport>) -> Self {
        Self {
            pipeline,
            checkpoint: checkpoint.map(Arc::new),
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let max_body_bytes = state.pipeline.resources().limits().max_payload_bytes;

    Router::new()
        .route("/run", post(run_handler))
        .route("/rpc", post(run_handler))
        .route("/runsync", post(run_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C / SIGTERM.
pub async fn serve(listener: tokio::net::TcpListener, app: Router) -> anyhow::Result<()> {
    info!("🌐 Listening on {} (POST /run)", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn run_handler(
    State(state): State<AppState>,
    path: MatchedPath,
    body: Bytes,
) -> Response {
    let route = path.as_str().to_string();

    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!(route = %route, error = %e, "Rejecting request with invalid JSON");
                metrics::REQUESTS.with_label_values(&[&route, "invalid_json"]).inc();
                return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid_json"})))
                    .into_response();
            }
        }
    };

    // Run in its own task so a panic turns into a 500 instead of a dropped connection
    let pipeline = state.pipeline.clone();
    match tokio::spawn(async move { pipeline.handle(payload).await }).await {
        Ok(response) => {
            let status = if response.is_ok() { "ok" } else { "error" };
            metrics::REQUESTS.with_label_values(&[&route, status]).inc();
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            error!(route = %route, error = %e, "Handler crashed");
            metrics::REQUESTS.with_label_values(&[&route, "crashed"]).inc();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let uptime = Utc::now().signed_duration_since(state.started_at);
    let resources = state.pipeline.resources().get_stats();
    Json(json!({
        "status": "ok",
        "model": state.pipeline.model_name(),
        "device": state.pipeline.device(),
        "checkpoint": state.checkpoint.as_deref(),
        "utilization_percent": resources.utilization_percent(),
        "resources": resources,
        "started_at": state.started_at.to_rfc3339(),
        "uptime_secs": uptime.num_seconds(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

async fn not_found_handler() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"})))
}
