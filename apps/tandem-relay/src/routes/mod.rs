mod websocket;

use std::path::Path;

use axum::{routing::get, Router};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{metrics, state::AppState};

/// HTTP surface: the signaling upgrade, health check, metrics, and the demo
/// client served from `static_dir` for every other path.
pub fn build_router(state: AppState, static_dir: impl AsRef<Path>) -> Router {
    Router::new()
        .route("/websocket", get(websocket::websocket_handler))
        .route("/healthz", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .fallback_service(ServeDir::new(static_dir.as_ref()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}
