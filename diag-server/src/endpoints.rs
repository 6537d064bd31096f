//! Entries of the server's handler table.
//!
//! Each function returns a small [`Router`] to be merged into the table. The
//! health route only ever reads heartbeat state through the slot it is
//! given; it never drives the monitor.

use std::sync::OnceLock;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use heartbeat::HeartbeatSlot;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const METRICS_PATH: &str = "/metrics";

pub const HEALTHY_BODY: &str = "OK";
pub const UNHEALTHY_BODY: &str = "NOT OK";

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// `OK` when a monitor is published and alive, `NOT OK` otherwise.
pub async fn healthz(State(slot): State<HeartbeatSlot>) -> &'static str {
    if slot.is_alive() {
        HEALTHY_BODY
    } else {
        UNHEALTHY_BODY
    }
}

pub fn healthz_routes(slot: HeartbeatSlot) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .with_state(slot)
}

pub fn metrics_routes(recorder_handle: PrometheusHandle) -> Router {
    Router::new().route(
        METRICS_PATH,
        get(move || std::future::ready(recorder_handle.render())),
    )
}

/// Handle to the process-wide Prometheus recorder, installed on first use.
pub fn metrics_recorder() -> PrometheusHandle {
    RECORDER.get_or_init(install_recorder).clone()
}

fn install_recorder() -> PrometheusHandle {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let builder = PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .unwrap_or_else(|e| {
            warn!(error = %e, "invalid histogram buckets, using summaries");
            PrometheusBuilder::new()
        });

    let recorder = builder.build_recorder();
    let handle = recorder.handle();
    if let Err(e) = metrics::set_global_recorder(recorder) {
        warn!(error = %e, "a global metrics recorder is already installed, /metrics will be empty");
    }
    handle
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
