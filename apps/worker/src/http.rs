//! HTTP adapter exposing health and metrics.
//!
//! `GET /health` answers liveness with 200 for healthy/degraded and 503
//! for unhealthy; `GET /health/detailed` returns the full system health
//! document; `GET /metrics` renders a text exposition of the worker
//! counters and queue gauges.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use flowline_application::{HealthService, HealthState, MetricsSnapshot, QueueStatus, SystemHealth, WorkerMetrics};
use serde::Serialize;
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Health composition service.
    pub health: Arc<HealthService>,
    /// Worker counters.
    pub metrics: Arc<WorkerMetrics>,
    /// Process start time, for uptime reporting.
    pub started_at: Instant,
}

/// Builds the health/metrics router.
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/detailed", get(health_detailed_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthSummary {
    status: &'static str,
    uptime_s: u64,
}

async fn health_handler(State(state): State<HttpState>) -> (StatusCode, Json<HealthSummary>) {
    let system = state.health.system_health().await;

    let http_status = match system.overall {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        http_status,
        Json(HealthSummary {
            status: system.overall.as_str(),
            uptime_s: state.started_at.elapsed().as_secs(),
        }),
    )
}

async fn health_detailed_handler(State(state): State<HttpState>) -> Json<SystemHealth> {
    Json(state.health.system_health().await)
}

async fn metrics_handler(State(state): State<HttpState>) -> String {
    let snapshot = state.metrics.snapshot();
    let queue = state.health.queue_health().await.status;

    render_metrics(&snapshot, &queue, state.started_at.elapsed().as_secs())
}

fn render_metrics(snapshot: &MetricsSnapshot, queue: &QueueStatus, uptime_s: u64) -> String {
    let mut out = String::new();

    let counters = [
        ("flowline_records_claimed_total", snapshot.records_claimed),
        ("flowline_records_completed_total", snapshot.records_completed),
        ("flowline_records_failed_total", snapshot.records_failed),
        ("flowline_orphans_reaped_total", snapshot.orphans_reaped),
        ("flowline_claim_errors_total", snapshot.claim_errors),
        ("flowline_report_errors_total", snapshot.report_errors),
    ];
    for (name, value) in counters {
        out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
    }

    let gauges = [
        ("flowline_queue_pending", queue.pending),
        ("flowline_queue_processing", queue.processing),
        ("flowline_queue_completed", queue.completed),
        ("flowline_queue_failed", queue.failed),
        ("flowline_uptime_seconds", uptime_s),
    ];
    for (name, value) in gauges {
        out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
    }

    out.push_str(&format!(
        "# TYPE flowline_avg_processing_ms gauge\nflowline_avg_processing_ms {}\n",
        snapshot.avg_processing_ms
    ));

    out
}
