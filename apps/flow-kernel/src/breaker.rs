// apps/flow-kernel/src/breaker.rs
// Purpose: Per-agent circuit breaker gating outbound dispatch.
// Architecture: Dispatch Guard Layer
// Dependencies: DashMap

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::AgentError;

#[derive(Debug, Clone, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Process-local breaker table keyed by agent id. After `threshold`
/// consecutive counted failures the breaker opens for `open_for`; while open,
/// dispatches fail fast. After the window one trial call is let through and a
/// single success closes the breaker.
pub struct BreakerTable {
    states: DashMap<String, BreakerState>,
    threshold: u32,
    open_for: Duration,
}

impl BreakerTable {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            states: DashMap::new(),
            threshold,
            open_for,
        }
    }

    /// Gate a dispatch. Err means fail fast with `AgentBreakerOpen`.
    pub fn check(&self, agent_id: &str) -> Result<(), AgentError> {
        if let Some(state) = self.states.get(agent_id) {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() < self.open_for {
                    return Err(AgentError::breaker_open());
                }
                // window elapsed: half-open, allow the trial call
            }
        }
        Ok(())
    }

    pub fn record_success(&self, agent_id: &str) {
        if let Some(mut state) = self.states.get_mut(agent_id) {
            state.consecutive_failures = 0;
            state.opened_at = None;
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        let mut state = self.states.entry(agent_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self, agent_id: &str) -> bool {
        self.check(agent_id).is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentErrorKind;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let table = BreakerTable::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            table.record_failure("x");
            assert!(table.check("x").is_ok());
        }
        table.record_failure("x");
        let err = table.check("x").unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::BreakerOpen);
    }

    #[test]
    fn success_resets_the_count() {
        let table = BreakerTable::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            table.record_failure("x");
        }
        table.record_success("x");
        for _ in 0..4 {
            table.record_failure("x");
        }
        assert!(table.check("x").is_ok());
    }

    #[test]
    fn half_open_after_window_and_closes_on_success() {
        let table = BreakerTable::new(2, Duration::from_millis(10));
        table.record_failure("x");
        table.record_failure("x");
        assert!(table.is_open("x"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(table.check("x").is_ok());

        table.record_success("x");
        assert!(!table.is_open("x"));
    }

    #[test]
    fn trial_failure_reopens() {
        let table = BreakerTable::new(2, Duration::from_millis(10));
        table.record_failure("x");
        table.record_failure("x");
        std::thread::sleep(Duration::from_millis(20));
        assert!(table.check("x").is_ok());
        table.record_failure("x");
        assert!(table.is_open("x"));
    }

    #[test]
    fn breakers_are_independent_per_agent() {
        let table = BreakerTable::new(1, Duration::from_secs(60));
        table.record_failure("x");
        assert!(table.is_open("x"));
        assert!(table.check("y").is_ok());
    }
}
