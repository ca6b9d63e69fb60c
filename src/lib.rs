pub mod adapter;
pub mod availability;
pub mod backend;
pub mod errors;
pub mod failover;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod probe;
pub mod selector;
pub mod state;

use std::sync::Arc;

use adapter::HistoryAdapter;
use availability::AvailabilityTracker;
use axum::{
    routing::{get, post},
    Router,
};
use backend::{databricks::DatabricksBackend, gemini::GeminiBackend, BackendPair};
use failover::FailoverConfig;
use probe::ProbeConfig;
use tracing::info;

pub fn build_state() -> Result<state::AppState, std::io::Error> {
    let primary = GeminiBackend::from_env().map_err(std::io::Error::other)?;
    let secondary = DatabricksBackend::from_env().map_err(std::io::Error::other)?;
    let backends = BackendPair::new(Arc::new(primary), Arc::new(secondary));

    let probe_config = ProbeConfig::from_env();
    let tracker = Arc::new(AvailabilityTracker::with_recovery_threshold(
        probe_config.recovery_probes,
    ));
    let state = state::AppState::new(
        backends,
        tracker,
        HistoryAdapter::from_env(),
        FailoverConfig::from_env(),
        probe_config.timeout,
    );

    state.probe.clone().spawn(probe_config.interval);
    info!(
        probe_interval_secs = probe_config.interval.as_secs(),
        recovery_probes = probe_config.recovery_probes,
        "backend probing started"
    );
    Ok(state)
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/status", get(handlers::api_status))
        .route("/chat", post(handlers::chat))
        .with_state(state)
}
