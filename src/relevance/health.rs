//! Relevance service health and circuit breaker state.
//!
//! Everything lives in atomics so the list path never takes a lock to
//! decide whether to call out. Timestamps are milliseconds since an
//! internal epoch, offset by one so that `0` means "never".

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::errors::RelevanceError;

/// Consecutive failures that open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How long an open circuit short-circuits calls.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// How long a health probe result is trusted.
pub const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    /// Cooldown elapsed; one probe call may go through.
    HalfOpen,
}

/// Shared health and breaker state for one relevance service.
#[derive(Debug)]
pub struct RelevanceHealth {
    epoch: Instant,
    healthy: AtomicBool,
    last_checked_ms: AtomicI64,
    health_ttl: Duration,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicI64,
    probe_in_flight: AtomicBool,
    failure_threshold: u32,
    cooldown: Duration,
}

impl Default for RelevanceHealth {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN, DEFAULT_HEALTH_TTL)
    }
}

impl RelevanceHealth {
    pub fn new(failure_threshold: u32, cooldown: Duration, health_ttl: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            healthy: AtomicBool::new(false),
            last_checked_ms: AtomicI64::new(0),
            health_ttl,
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            probe_in_flight: AtomicBool::new(false),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64 + 1
    }

    fn since_ms(&self, stamp: i64) -> u64 {
        (self.now_ms() - stamp).max(0) as u64
    }

    // ─── Circuit ─────────────────────────────────────────────────────────

    pub fn circuit_state(&self) -> CircuitState {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if opened_at == 0 {
            CircuitState::Closed
        } else if self.since_ms(opened_at) < self.cooldown.as_millis() as u64 {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    /// Ask permission to call the service.
    ///
    /// Closed: always granted. Open: refused. Half-open: granted to exactly
    /// one caller at a time, whose [`CallPermit::is_probe`] is true.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, RelevanceError> {
        match self.circuit_state() {
            CircuitState::Closed => Ok(CallPermit {
                health: self,
                probe: None,
            }),
            CircuitState::Open => Err(RelevanceError::CircuitOpen),
            CircuitState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| CallPermit {
                    health: self,
                    probe: Some(ProbeGuard { health: self }),
                })
                .map_err(|_| RelevanceError::CircuitOpen),
        }
    }

    /// A call succeeded: reset failures and close the circuit.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
        self.last_checked_ms.store(self.now_ms(), Ordering::Release);
        if self.opened_at_ms.swap(0, Ordering::AcqRel) != 0 {
            tracing::info!("relevance circuit closed");
        }
    }

    /// A call failed: count it, and open the circuit at the threshold.
    ///
    /// Failures reported while the circuit is already open (calls admitted
    /// before it opened) are counted but leave the cooldown alone.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.failure_threshold {
            return;
        }
        let opened = self
            .opened_at_ms
            .compare_exchange(0, self.now_ms(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if opened {
            tracing::warn!(
                failures,
                cooldown_secs = self.cooldown.as_secs(),
                "relevance circuit opened"
            );
        }
    }

    /// The half-open probe failed: restart the cooldown.
    fn reopen(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        tracing::warn!(failures, "relevance probe failed, circuit re-opened");
    }

    /// Force the circuit open now.
    pub fn trip(&self) {
        self.consecutive_failures
            .fetch_max(self.failure_threshold, Ordering::AcqRel);
        self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        tracing::warn!("relevance circuit forced open");
    }

    // ─── Health cache ────────────────────────────────────────────────────

    /// The last probe result, if it is younger than the health TTL.
    pub fn cached_health(&self) -> Option<bool> {
        let checked = self.last_checked_ms.load(Ordering::Acquire);
        if checked == 0 || self.since_ms(checked) >= self.health_ttl.as_millis() as u64 {
            return None;
        }
        Some(self.healthy.load(Ordering::Acquire))
    }

    pub fn record_probe(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
        self.last_checked_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn status(&self) -> HealthStatus {
        let checked = self.last_checked_ms.load(Ordering::Acquire);
        HealthStatus {
            healthy: self.cached_health(),
            circuit: self.circuit_state(),
            consecutive_failures: self.consecutive_failures(),
            last_checked_ms_ago: (checked != 0).then(|| self.since_ms(checked)),
        }
    }
}

/// Permission to make one relevance call. Report the outcome with
/// [`CallPermit::succeeded`] or [`CallPermit::failed`]; dropping it reports
/// nothing.
#[derive(Debug)]
pub struct CallPermit<'a> {
    health: &'a RelevanceHealth,
    probe: Option<ProbeGuard<'a>>,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// The call worked: close the circuit.
    pub fn succeeded(self) {
        self.health.record_success();
    }

    /// The call failed. A failed probe re-opens the circuit; any other
    /// failure counts toward the threshold.
    pub fn failed(self) {
        if self.is_probe() {
            self.health.reopen();
        } else {
            self.health.record_failure();
        }
    }
}

/// Releases the half-open probe slot however the probe ends.
#[derive(Debug)]
struct ProbeGuard<'a> {
    health: &'a RelevanceHealth,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.health.probe_in_flight.store(false, Ordering::Release);
    }
}

/// Point-in-time view of [`RelevanceHealth`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// `None` when no fresh probe result is cached.
    pub healthy: Option<bool>,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub last_checked_ms_ago: Option<u64>,
}
