use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use tracing::{info, warn};

use crate::models::{AvailabilityState, BackendId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub state: AvailabilityState,
    pub last_checked: Option<SystemTime>,
}

/// Point-in-time copy of both backend states. Selection runs against this, never against the
/// live tracker, so one decision sees one consistent view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub primary: AvailabilityState,
    pub secondary: AvailabilityState,
}

impl AvailabilitySnapshot {
    pub fn state(&self, backend: BackendId) -> AvailabilityState {
        match backend {
            BackendId::Primary => self.primary,
            BackendId::Secondary => self.secondary,
        }
    }

    /// Overlay demotions already applied during the current request.
    pub fn excluding(mut self, demoted: &[BackendId]) -> Self {
        for backend in demoted {
            match backend {
                BackendId::Primary => self.primary = AvailabilityState::Degraded,
                BackendId::Secondary => self.secondary = AvailabilityState::Degraded,
            }
        }
        self
    }
}

#[derive(Debug)]
struct BackendHealth {
    state: AvailabilityState,
    last_checked: Option<SystemTime>,
    consecutive_probe_successes: u32,
}

impl BackendHealth {
    fn new(state: AvailabilityState) -> Self {
        Self {
            state,
            last_checked: None,
            consecutive_probe_successes: 0,
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    primary: BackendHealth,
    secondary: BackendHealth,
}

impl TrackerState {
    fn health_mut(&mut self, backend: BackendId) -> &mut BackendHealth {
        match backend {
            BackendId::Primary => &mut self.primary,
            BackendId::Secondary => &mut self.secondary,
        }
    }

    fn health(&self, backend: BackendId) -> &BackendHealth {
        match backend {
            BackendId::Primary => &self.primary,
            BackendId::Secondary => &self.secondary,
        }
    }
}

/// Process-wide reachability state for the two backends.
///
/// Demotion and promotion are idempotent: applying either twice leaves the same state as
/// applying it once, so concurrent failures on one backend collapse into a single transition.
/// Probe-driven promotion of a degraded backend waits for `recovery_threshold` consecutive
/// healthy probes.
#[derive(Debug)]
pub struct AvailabilityTracker {
    inner: Mutex<TrackerState>,
    recovery_threshold: u32,
}

impl Default for AvailabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityTracker {
    /// Primary starts available; secondary stays degraded until a probe confirms it.
    pub fn new() -> Self {
        Self::with_recovery_threshold(1)
    }

    pub fn with_recovery_threshold(recovery_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                primary: BackendHealth::new(AvailabilityState::Available),
                secondary: BackendHealth::new(AvailabilityState::Degraded),
            }),
            recovery_threshold: recovery_threshold.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self, backend: BackendId) -> bool {
        self.lock().health(backend).state.is_available()
    }

    pub fn availability(&self, backend: BackendId) -> Availability {
        let state = self.lock();
        let health = state.health(backend);
        Availability {
            state: health.state,
            last_checked: health.last_checked,
        }
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        let state = self.lock();
        AvailabilitySnapshot {
            primary: state.primary.state,
            secondary: state.secondary.state,
        }
    }

    /// Returns `true` only when this call performed the transition.
    pub fn mark_degraded(&self, backend: BackendId) -> bool {
        let mut state = self.lock();
        let health = state.health_mut(backend);
        health.consecutive_probe_successes = 0;
        health.last_checked = Some(SystemTime::now());
        if health.state == AvailabilityState::Degraded {
            return false;
        }
        health.state = AvailabilityState::Degraded;
        drop(state);

        warn!(backend = %backend, "backend marked degraded");
        true
    }

    /// Unconditional promotion, bypassing probe hysteresis.
    pub fn mark_available(&self, backend: BackendId) -> bool {
        let mut state = self.lock();
        let health = state.health_mut(backend);
        health.last_checked = Some(SystemTime::now());
        if health.state == AvailabilityState::Available {
            return false;
        }
        health.state = AvailabilityState::Available;
        drop(state);

        info!(backend = %backend, "backend marked available");
        true
    }

    pub fn record_probe(&self, backend: BackendId, healthy: bool) -> AvailabilityState {
        if !healthy {
            self.mark_degraded(backend);
            return AvailabilityState::Degraded;
        }

        let mut state = self.lock();
        let health = state.health_mut(backend);
        health.last_checked = Some(SystemTime::now());
        health.consecutive_probe_successes = health.consecutive_probe_successes.saturating_add(1);
        if health.state == AvailabilityState::Available {
            return AvailabilityState::Available;
        }
        if health.consecutive_probe_successes < self.recovery_threshold {
            return AvailabilityState::Degraded;
        }

        health.state = AvailabilityState::Available;
        let probes = health.consecutive_probe_successes;
        drop(state);

        info!(backend = %backend, probes, "backend recovered after healthy probes");
        AvailabilityState::Available
    }
}
