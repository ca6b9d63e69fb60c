use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder,
};

use crate::{availability::AvailabilitySnapshot, models::BackendId};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_attempts_total: IntCounterVec,
    backend_errors_total: IntCounterVec,
    failovers_total: IntCounter,
    backend_available: IntGaugeVec,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "assistant_http_requests_total",
                "Total HTTP requests processed by the assistant gateway"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "assistant_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method", "stream"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "assistant_inflight_requests",
            "Current in-flight requests at the assistant gateway",
        )
        .expect("valid inflight_requests metric");

        let backend_attempts_total = IntCounterVec::new(
            opts!(
                "assistant_backend_attempts_total",
                "Backend call attempts by backend and outcome"
            ),
            &["backend", "outcome"],
        )
        .expect("valid backend_attempts_total metric");

        let backend_errors_total = IntCounterVec::new(
            opts!(
                "assistant_backend_errors_total",
                "Backend call errors by backend and kind"
            ),
            &["backend", "kind"],
        )
        .expect("valid backend_errors_total metric");

        let failovers_total = IntCounter::new(
            "assistant_failovers_total",
            "Requests that fell back from the primary to the next backend",
        )
        .expect("valid failovers_total metric");

        let backend_available = IntGaugeVec::new(
            opts!(
                "assistant_backend_available",
                "1 when the backend is currently selectable"
            ),
            &["backend"],
        )
        .expect("valid backend_available metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_attempts_total.clone()))
            .expect("register backend_attempts_total");
        registry
            .register(Box::new(backend_errors_total.clone()))
            .expect("register backend_errors_total");
        registry
            .register(Box::new(failovers_total.clone()))
            .expect("register failovers_total");
        registry
            .register(Box::new(backend_available.clone()))
            .expect("register backend_available");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            backend_attempts_total,
            backend_errors_total,
            failovers_total,
            backend_available,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(
        &self,
        path: &str,
        method: &str,
        stream: bool,
        status: u16,
        duration: Duration,
    ) {
        let stream_label = if stream { "true" } else { "false" };
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label, stream_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method, stream_label])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_attempt(&self, backend: BackendId, outcome: &str) {
        self.backend_attempts_total
            .with_label_values(&[backend.as_str(), outcome])
            .inc();
    }

    pub fn observe_backend_error(&self, backend: BackendId, kind: &str) {
        self.backend_errors_total
            .with_label_values(&[backend.as_str(), kind])
            .inc();
    }

    pub fn observe_failover(&self) {
        self.failovers_total.inc();
    }

    pub fn observe_availability(&self, snapshot: &AvailabilitySnapshot) {
        for backend in BackendId::ALL {
            let value = i64::from(snapshot.state(backend).is_available());
            self.backend_available
                .with_label_values(&[backend.as_str()])
                .set(value);
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AvailabilityState;

    #[test]
    fn render_includes_failover_and_availability_series() {
        let metrics = AppMetrics::new();
        metrics.observe_failover();
        metrics.observe_attempt(BackendId::Secondary, "success");
        metrics.observe_availability(&AvailabilitySnapshot {
            primary: AvailabilityState::Degraded,
            secondary: AvailabilityState::Available,
        });

        let body = metrics.render().expect("metrics should render");

        assert!(body.contains("assistant_failovers_total 1"));
        assert!(body.contains(r#"assistant_backend_available{backend="primary"} 0"#));
        assert!(body.contains(r#"assistant_backend_available{backend="secondary"} 1"#));
    }
}
