pub mod assemble;
pub mod config;
pub mod error;
pub mod expand;
pub mod grafana;
pub mod handlers;
pub mod models;
pub mod pdf;
pub mod render;
pub mod report;

use axum::{Router, routing::get};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use config::CollectorConfig;

#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub config: Arc<CollectorConfig>,
    /// Parent of the per-report work directories.
    pub tmp_root: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Reports
        .route("/api/report/{dash}", get(handlers::report::report))
        .route("/api/v5/report/{dash}", get(handlers::report::report_v5))
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
