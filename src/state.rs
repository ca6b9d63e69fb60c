use std::sync::Arc;

use crate::{
    adapter::HistoryAdapter,
    availability::AvailabilityTracker,
    backend::BackendPair,
    failover::{FailoverConfig, FailoverController},
    metrics::AppMetrics,
    probe::StatusProbe,
};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FailoverController>,
    pub probe: Arc<StatusProbe>,
    pub tracker: Arc<AvailabilityTracker>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(
        backends: BackendPair,
        tracker: Arc<AvailabilityTracker>,
        adapter: HistoryAdapter,
        failover: FailoverConfig,
        probe_timeout: std::time::Duration,
    ) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        let controller = Arc::new(FailoverController::new(
            backends.clone(),
            tracker.clone(),
            adapter,
            failover,
            metrics.clone(),
        ));
        let probe = Arc::new(StatusProbe::new(backends, tracker.clone(), probe_timeout));
        Self {
            controller,
            probe,
            tracker,
            metrics,
        }
    }

    /// Default adapter and timeouts, cold-start availability.
    pub fn new_for_tests(backends: BackendPair) -> Self {
        Self::new(
            backends,
            Arc::new(AvailabilityTracker::new()),
            HistoryAdapter::default(),
            FailoverConfig::default(),
            std::time::Duration::from_secs(1),
        )
    }
}
