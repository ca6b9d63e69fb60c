use std::{env, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    availability::AvailabilityTracker,
    backend::{BackendError, BackendPair},
    models::{AvailabilityState, BackendId, StatusSnapshot},
    selector::select,
};

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub recovery_probes: u32,
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        let interval_secs = env::var("ASSISTANT_PROBE_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(60);
        let timeout_secs = env::var("ASSISTANT_PROBE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(10);
        let recovery_probes = env::var("ASSISTANT_RECOVERY_PROBES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(1);

        Self {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
            recovery_probes,
        }
    }
}

/// Runs reachability checks and feeds their outcome into the tracker. Never fails.
pub struct StatusProbe {
    backends: BackendPair,
    tracker: Arc<AvailabilityTracker>,
    timeout: Duration,
}

impl StatusProbe {
    pub fn new(backends: BackendPair, tracker: Arc<AvailabilityTracker>, timeout: Duration) -> Self {
        Self {
            backends,
            tracker,
            timeout,
        }
    }

    pub async fn probe(&self, backend: BackendId) -> AvailabilityState {
        let endpoint = self.backends.get(backend);
        let result = match tokio::time::timeout(self.timeout, endpoint.probe()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "probe exceeded {}s",
                self.timeout.as_secs()
            ))),
        };

        match result {
            Ok(()) => {
                let state = self.tracker.record_probe(backend, true);
                debug!(backend = %backend, name = endpoint.name(), ?state, "probe succeeded");
                state
            }
            Err(error) => {
                warn!(
                    backend = %backend,
                    name = endpoint.name(),
                    kind = error.kind(),
                    error = %error,
                    "probe failed"
                );
                self.tracker.record_probe(backend, false)
            }
        }
    }

    /// Probes both backends in priority order and reports the resulting state.
    pub async fn check_once(&self) -> StatusSnapshot {
        let primary = self.probe(BackendId::Primary).await;
        let secondary = self.probe(BackendId::Secondary).await;
        let status = StatusSnapshot::new(primary, secondary, select(&self.tracker.snapshot()));
        info!(
            primary = status.primary,
            secondary = status.secondary,
            active = status.active,
            "backend status refreshed"
        );
        status
    }

    /// Current state without probing.
    pub fn status(&self) -> StatusSnapshot {
        let snapshot = self.tracker.snapshot();
        StatusSnapshot::new(snapshot.primary, snapshot.secondary, select(&snapshot))
    }

    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.check_once().await;
                sleep(interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockReply};

    fn probe_with(
        primary: Arc<MockBackend>,
        secondary: Arc<MockBackend>,
        tracker: Arc<AvailabilityTracker>,
    ) -> StatusProbe {
        StatusProbe::new(
            BackendPair::new(primary, secondary),
            tracker,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn healthy_probes_confirm_the_secondary() {
        let primary = Arc::new(MockBackend::streaming(BackendId::Primary, "hi"));
        let secondary = Arc::new(MockBackend::complete(BackendId::Secondary, "hi"));
        let tracker = Arc::new(AvailabilityTracker::new());
        let probe = probe_with(primary.clone(), secondary.clone(), tracker.clone());

        let status = probe.check_once().await;

        assert_eq!(status.primary, "available");
        assert_eq!(status.secondary, "available");
        assert_eq!(status.active, "primary");
        assert_eq!(primary.probes(), 1);
        assert_eq!(secondary.probes(), 1);
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn failing_primary_probe_shifts_active_backend() {
        let primary = Arc::new(
            MockBackend::new(BackendId::Primary, MockReply::QuotaExceeded)
                .with_probe_healthy(false),
        );
        let secondary = Arc::new(MockBackend::complete(BackendId::Secondary, "hi"));
        let tracker = Arc::new(AvailabilityTracker::new());
        let probe = probe_with(primary, secondary, tracker.clone());

        let status = probe.check_once().await;

        assert_eq!(status.primary, "limited");
        assert_eq!(status.active, "secondary");
        assert!(!tracker.is_available(BackendId::Primary));
    }

    #[tokio::test]
    async fn recovered_primary_is_promoted_by_the_next_probe() {
        let primary = Arc::new(MockBackend::streaming(BackendId::Primary, "hi"));
        let secondary =
            Arc::new(MockBackend::complete(BackendId::Secondary, "hi").with_probe_healthy(false));
        let tracker = Arc::new(AvailabilityTracker::new());
        tracker.mark_degraded(BackendId::Primary);
        let probe = probe_with(primary, secondary, tracker.clone());

        assert_eq!(probe.status().active, "unavailable");
        let status = probe.check_once().await;

        assert_eq!(status.active, "primary");
        assert_eq!(status.secondary, "unavailable");
    }

    #[tokio::test]
    async fn flapping_primary_needs_consecutive_healthy_checks() {
        let primary = Arc::new(MockBackend::streaming(BackendId::Primary, "hi"));
        let secondary = Arc::new(MockBackend::complete(BackendId::Secondary, "hi"));
        let tracker = Arc::new(AvailabilityTracker::with_recovery_threshold(2));
        let probe = probe_with(primary.clone(), secondary, tracker.clone());

        primary.set_probe_healthy(false);
        assert_eq!(probe.check_once().await.primary, "limited");

        primary.set_probe_healthy(true);
        let status = probe.check_once().await;
        assert_eq!(status.primary, "limited");
        assert_eq!(status.active, "secondary");

        primary.set_probe_healthy(false);
        probe.check_once().await;
        primary.set_probe_healthy(true);
        assert_eq!(probe.check_once().await.primary, "limited");

        let status = probe.check_once().await;
        assert_eq!(status.primary, "available");
        assert_eq!(status.active, "primary");
        assert_eq!(primary.probes(), 5);
    }

    #[tokio::test]
    async fn probe_timeout_counts_as_degraded() {
        struct SlowProbe;

        #[async_trait::async_trait]
        impl crate::backend::ChatBackend for SlowProbe {
            fn id(&self) -> BackendId {
                BackendId::Secondary
            }

            fn name(&self) -> &str {
                "slow"
            }

            async fn generate(
                &self,
                _payload: crate::adapter::BackendPayload,
            ) -> Result<crate::backend::RawResponse, BackendError> {
                Err(BackendError::Unavailable("unused".to_owned()))
            }

            async fn probe(&self) -> Result<(), BackendError> {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }

        let tracker = Arc::new(AvailabilityTracker::new());
        let probe = StatusProbe::new(
            BackendPair::new(
                Arc::new(MockBackend::streaming(BackendId::Primary, "hi")),
                Arc::new(SlowProbe),
            ),
            tracker.clone(),
            Duration::from_millis(20),
        );

        assert_eq!(
            probe.probe(BackendId::Secondary).await,
            AvailabilityState::Degraded
        );
    }
}
