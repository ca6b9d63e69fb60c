use std::{env, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    adapter::HistoryAdapter,
    availability::AvailabilityTracker,
    backend::{BackendError, BackendPair, RawResponse},
    metrics::AppMetrics,
    models::{BackendId, ChatHistory},
    normalize::{normalize_observed, prime, NormalizedResponse},
    selector::select,
};

/// One attempt on the selected backend plus one fallback hop.
pub const MAX_ATTEMPTS: usize = 2;

pub const SERVICE_UNAVAILABLE_MESSAGE: &str =
    "Sorry, the chat service is not available right now. Please check the API status and try again later.";

pub const SECONDARY_UNAVAILABLE_MESSAGE: &str =
    "Sorry, the fallback service is not available at the moment either.";

#[derive(Debug, Clone, Copy)]
pub struct FailoverConfig {
    pub call_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(90),
        }
    }
}

impl FailoverConfig {
    pub fn from_env() -> Self {
        let call_timeout_secs = env::var("ASSISTANT_CALL_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(90);
        Self {
            call_timeout: Duration::from_secs(call_timeout_secs),
        }
    }
}

pub struct FailoverController {
    backends: BackendPair,
    tracker: Arc<AvailabilityTracker>,
    adapter: HistoryAdapter,
    config: FailoverConfig,
    metrics: Arc<AppMetrics>,
}

impl FailoverController {
    pub fn new(
        backends: BackendPair,
        tracker: Arc<AvailabilityTracker>,
        adapter: HistoryAdapter,
        config: FailoverConfig,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            backends,
            tracker,
            adapter,
            config,
            metrics,
        }
    }

    /// Answers `history` from the highest-priority reachable backend.
    ///
    /// Backend failures never surface as errors: they demote the backend, trigger at most one
    /// fallback hop, and otherwise end in a fixed advisory reply.
    pub async fn respond(&self, history: &ChatHistory) -> NormalizedResponse {
        let mut demoted: Vec<BackendId> = Vec::with_capacity(MAX_ATTEMPTS);

        for attempt in 1..=MAX_ATTEMPTS {
            let snapshot = self.tracker.snapshot().excluding(&demoted);
            let Some(backend) = select(&snapshot) else {
                info!(attempt, "no backend available");
                return NormalizedResponse::fixed(SERVICE_UNAVAILABLE_MESSAGE);
            };

            debug!(attempt, backend = %backend, "backend selected");
            let started = Instant::now();
            match self.attempt(backend, history).await {
                Ok(raw) => {
                    self.metrics.observe_attempt(backend, "success");
                    debug!(
                        backend = %backend,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "backend answered"
                    );
                    return normalize_observed(
                        raw,
                        backend,
                        self.tracker.clone(),
                        self.metrics.clone(),
                    );
                }
                Err(error) => {
                    self.metrics.observe_attempt(backend, "failure");
                    self.metrics.observe_backend_error(backend, error.kind());
                    warn!(
                        attempt,
                        backend = %backend,
                        kind = error.kind(),
                        error = %error,
                        "backend call failed"
                    );
                    self.tracker.mark_degraded(backend);
                    demoted.push(backend);

                    if backend == BackendId::Secondary {
                        return NormalizedResponse::fixed(SECONDARY_UNAVAILABLE_MESSAGE);
                    }
                    if attempt < MAX_ATTEMPTS {
                        self.metrics.observe_failover();
                        info!(from = %backend, "falling back to next backend");
                    }
                }
            }
        }

        NormalizedResponse::fixed(SERVICE_UNAVAILABLE_MESSAGE)
    }

    async fn attempt(
        &self,
        backend: BackendId,
        history: &ChatHistory,
    ) -> Result<RawResponse, BackendError> {
        let endpoint = self.backends.get(backend);
        let payload = self.adapter.adapt(history, backend);
        let call = async {
            let raw = endpoint.generate(payload).await?;
            prime(raw).await
        };

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(format!(
                "{} gave no response within {}s",
                endpoint.name(),
                self.config.call_timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::{
        adapter::BackendPayload,
        backend::mock::{MockBackend, MockReply},
        models::ChatMessage,
        normalize::ResponseEvent,
    };

    struct Harness {
        primary: Arc<MockBackend>,
        secondary: Arc<MockBackend>,
        tracker: Arc<AvailabilityTracker>,
        controller: FailoverController,
    }

    fn harness(primary: MockBackend, secondary: MockBackend) -> Harness {
        let primary = Arc::new(primary);
        let secondary = Arc::new(secondary);
        let tracker = Arc::new(AvailabilityTracker::new());
        tracker.mark_available(BackendId::Secondary);
        let controller = FailoverController::new(
            BackendPair::new(primary.clone(), secondary.clone()),
            tracker.clone(),
            HistoryAdapter::default(),
            FailoverConfig {
                call_timeout: Duration::from_millis(200),
            },
            Arc::new(AppMetrics::new()),
        );
        Harness {
            primary,
            secondary,
            tracker,
            controller,
        }
    }

    fn hi() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hi")]
    }

    #[tokio::test]
    async fn healthy_primary_serves_without_touching_secondary() {
        let h = harness(
            MockBackend::streaming(BackendId::Primary, "hello from primary"),
            MockBackend::complete(BackendId::Secondary, "hello from secondary"),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.served_by(), Some(BackendId::Primary));
        assert_eq!(response.collect_text().await, "hello from primary");
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.secondary.calls(), 0);
        assert!(matches!(
            h.primary.last_payload(),
            Some(BackendPayload::Gemini(_))
        ));
    }

    #[tokio::test]
    async fn quota_on_primary_falls_back_to_secondary_once() {
        let h = harness(
            MockBackend::new(BackendId::Primary, MockReply::QuotaExceeded),
            MockBackend::complete(BackendId::Secondary, "hello from secondary"),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.served_by(), Some(BackendId::Secondary));
        assert_eq!(response.collect_text().await, "hello from secondary");
        assert!(!h.tracker.is_available(BackendId::Primary));
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.secondary.calls(), 1);
        assert!(matches!(
            h.secondary.last_payload(),
            Some(BackendPayload::Databricks(_))
        ));
    }

    #[tokio::test]
    async fn both_degraded_makes_no_calls() {
        let h = harness(
            MockBackend::streaming(BackendId::Primary, "unused"),
            MockBackend::complete(BackendId::Secondary, "unused"),
        );
        h.tracker.mark_degraded(BackendId::Primary);
        h.tracker.mark_degraded(BackendId::Secondary);

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.served_by(), None);
        assert_eq!(response.collect_text().await, SERVICE_UNAVAILABLE_MESSAGE);
        assert_eq!(h.primary.calls(), 0);
        assert_eq!(h.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn failing_secondary_returns_its_advisory_without_retrying() {
        let h = harness(
            MockBackend::new(BackendId::Primary, MockReply::Unavailable),
            MockBackend::new(BackendId::Secondary, MockReply::Malformed),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.collect_text().await, SECONDARY_UNAVAILABLE_MESSAGE);
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.secondary.calls(), 1);
        assert!(!h.tracker.is_available(BackendId::Primary));
        assert!(!h.tracker.is_available(BackendId::Secondary));
    }

    #[tokio::test]
    async fn primary_failure_with_unconfirmed_secondary_reports_unavailable() {
        let h = harness(
            MockBackend::new(BackendId::Primary, MockReply::Unavailable),
            MockBackend::complete(BackendId::Secondary, "unused"),
        );
        h.tracker.mark_degraded(BackendId::Secondary);

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.collect_text().await, SERVICE_UNAVAILABLE_MESSAGE);
        assert_eq!(h.primary.calls(), 1);
        assert_eq!(h.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn degraded_primary_routes_straight_to_secondary() {
        let h = harness(
            MockBackend::streaming(BackendId::Primary, "unused"),
            MockBackend::complete(BackendId::Secondary, "Hello!"),
        );
        h.tracker.mark_degraded(BackendId::Primary);

        let events = h.controller.respond(&hi()).await.collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                ResponseEvent::Delta("Hello!".to_owned()),
                ResponseEvent::Done("Hello!".to_owned()),
            ]
        );
        assert_eq!(h.primary.calls(), 0);
    }

    #[tokio::test]
    async fn timeout_counts_as_a_call_error() {
        let h = harness(
            MockBackend::new(BackendId::Primary, MockReply::Hang),
            MockBackend::complete(BackendId::Secondary, "late but here"),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.collect_text().await, "late but here");
        assert!(!h.tracker.is_available(BackendId::Primary));
    }

    #[tokio::test]
    async fn stream_failing_before_text_falls_back() {
        let h = harness(
            MockBackend::new(BackendId::Primary, MockReply::Interrupted(vec![])),
            MockBackend::complete(BackendId::Secondary, "fallback text"),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.served_by(), Some(BackendId::Secondary));
        assert_eq!(response.collect_text().await, "fallback text");
    }

    #[tokio::test]
    async fn stream_failing_after_text_keeps_partial_reply() {
        let h = harness(
            MockBackend::new(
                BackendId::Primary,
                MockReply::Interrupted(vec!["partial ".to_owned(), "reply".to_owned()]),
            ),
            MockBackend::complete(BackendId::Secondary, "unused"),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.collect_text().await, "partial reply");
        assert!(!h.tracker.is_available(BackendId::Primary));
        assert_eq!(h.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn call_timeout_bounds_only_the_first_text() {
        let h = harness(
            MockBackend::streaming(BackendId::Primary, "one two three four")
                .with_token_delay(Duration::from_millis(80)),
            MockBackend::complete(BackendId::Secondary, "unused"),
        );

        let response = h.controller.respond(&hi()).await;

        assert_eq!(response.served_by(), Some(BackendId::Primary));
        assert_eq!(response.collect_text().await, "one two three four");
        assert!(h.tracker.is_available(BackendId::Primary));
        assert_eq!(h.secondary.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_primary_failures_share_one_demotion() {
        let h = Arc::new(harness(
            MockBackend::new(BackendId::Primary, MockReply::QuotaExceeded),
            MockBackend::complete(BackendId::Secondary, "ok"),
        ));

        let tasks = (0..4)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.controller.respond(&hi()).await.collect_text().await })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert_eq!(task.await.expect("request should finish"), "ok");
        }

        assert!(!h.tracker.is_available(BackendId::Primary));
        assert!(h.tracker.is_available(BackendId::Secondary));
        assert!(h.primary.calls() <= 4);
        assert_eq!(h.secondary.calls(), 4);
    }
}
