//! Fallback policy: when list results are filtered and when they aren't.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use serde::Serialize;

use crate::relevance::PassThroughReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PolicyState {
    /// Lists are filtered by relevance.
    Normal = 0,
    /// Lists return the capped, unfiltered catalog.
    Degraded = 1,
}

/// Tracks the router's filtering mode.
///
/// Enters `Degraded` when the relevance circuit opens or the catalog is
/// empty; returns to `Normal` on the next successful selection.
#[derive(Debug, Default)]
pub struct FallbackPolicy {
    state: AtomicU8,
    transitions: AtomicU64,
    last_reason: StdMutex<Option<PassThroughReason>>,
}

impl FallbackPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PolicyState {
        match self.state.load(Ordering::Acquire) {
            0 => PolicyState::Normal,
            _ => PolicyState::Degraded,
        }
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Acquire)
    }

    /// Reason recorded by the most recent pass-through.
    pub fn last_reason(&self) -> Option<PassThroughReason> {
        *self.last_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A list call was filtered successfully.
    pub fn on_selected(&self) {
        self.transition(PolicyState::Normal, None);
    }

    /// A list call passed through. Only reasons that signal a sustained
    /// outage move the policy to `Degraded`; one-off failures are recorded
    /// but leave the state alone.
    pub fn on_pass_through(&self, reason: PassThroughReason) {
        *self.last_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        if degrades(reason) {
            self.transition(PolicyState::Degraded, Some(reason));
        }
    }

    fn transition(&self, next: PolicyState, reason: Option<PassThroughReason>) {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            self.transitions.fetch_add(1, Ordering::AcqRel);
            match reason {
                Some(reason) => {
                    tracing::warn!(reason = %reason, "fallback policy degraded, lists unfiltered")
                }
                None => tracing::info!("fallback policy back to normal"),
            }
        }
    }
}

fn degrades(reason: PassThroughReason) -> bool {
    matches!(
        reason,
        PassThroughReason::CircuitOpen | PassThroughReason::EmptyCatalog
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_normal() {
        let policy = FallbackPolicy::new();
        assert_eq!(policy.state(), PolicyState::Normal);
        assert_eq!(policy.transitions(), 0);
        assert_eq!(policy.last_reason(), None);
    }

    #[test]
    fn circuit_open_degrades_and_success_recovers() {
        let policy = FallbackPolicy::new();
        policy.on_pass_through(PassThroughReason::CircuitOpen);
        assert_eq!(policy.state(), PolicyState::Degraded);

        policy.on_pass_through(PassThroughReason::CircuitOpen);
        assert_eq!(policy.transitions(), 1);

        policy.on_selected();
        assert_eq!(policy.state(), PolicyState::Normal);
        assert_eq!(policy.transitions(), 2);
        assert_eq!(policy.last_reason(), Some(PassThroughReason::CircuitOpen));
    }

    #[test]
    fn empty_catalog_degrades() {
        let policy = FallbackPolicy::new();
        policy.on_pass_through(PassThroughReason::EmptyCatalog);
        assert_eq!(policy.state(), PolicyState::Degraded);
    }

    #[test]
    fn single_timeout_does_not_degrade() {
        let policy = FallbackPolicy::new();
        policy.on_pass_through(PassThroughReason::Timeout);
        assert_eq!(policy.state(), PolicyState::Normal);
        assert_eq!(policy.last_reason(), Some(PassThroughReason::Timeout));
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&PolicyState::Degraded).unwrap(),
            "\"degraded\""
        );
    }
}
