//! Binding health: consecutive-failure counting and timed blacklists.
//!
//! Updates are read-mostly and atomic behind one mutex; ordering of
//! concurrent health transitions is best-effort by design.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Failures in a row before a binding is blacklisted.
const BLACKLIST_AFTER: u32 = 2;

#[derive(Debug, Default, Clone)]
struct BindingState {
    consecutive_failures: u32,
    blacklisted_until: Option<Instant>,
}

/// Point-in-time health snapshot for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub provider_id: String,
    pub consecutive_failures: u32,
    pub blacklisted: bool,
    pub blacklist_remaining_ms: Option<u64>,
}

pub struct HealthTracker {
    states: Mutex<HashMap<String, BindingState>>,
    blacklist_for: Duration,
}

impl HealthTracker {
    pub fn new(blacklist_seconds: u64) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            blacklist_for: Duration::from_secs(blacklist_seconds),
        }
    }

    /// Record a failed call. The second consecutive failure blacklists
    /// the binding, no matter how many parallel calls observed them.
    pub fn record_failure(&self, provider_id: &str) {
        let mut states = self.states.lock();
        let state = states.entry(provider_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BLACKLIST_AFTER && state.blacklisted_until.is_none() {
            state.blacklisted_until = Some(Instant::now() + self.blacklist_for);
            tracing::warn!(
                provider = provider_id,
                failures = state.consecutive_failures,
                blacklist_secs = self.blacklist_for.as_secs(),
                "binding blacklisted"
            );
        }
    }

    /// Record a successful call: clears the failure streak and any
    /// blacklist.
    pub fn record_success(&self, provider_id: &str) {
        let mut states = self.states.lock();
        let state = states.entry(provider_id.to_string()).or_default();
        state.consecutive_failures = 0;
        state.blacklisted_until = None;
    }

    /// Whether the binding is currently blacklisted. Expired entries
    /// are cleared on read.
    pub fn is_blacklisted(&self, provider_id: &str) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(provider_id) else {
            return false;
        };
        match state.blacklisted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Expiry lifts the blacklist but keeps the streak at the
                // threshold: one more failure re-blacklists immediately.
                state.blacklisted_until = None;
                false
            }
            None => false,
        }
    }

    pub fn snapshot(&self, provider_id: &str) -> HealthSnapshot {
        let states = self.states.lock();
        let state = states.get(provider_id).cloned().unwrap_or_default();
        let now = Instant::now();
        let remaining = state
            .blacklisted_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_millis() as u64);
        HealthSnapshot {
            provider_id: provider_id.to_string(),
            consecutive_failures: state.consecutive_failures,
            blacklisted: remaining.is_some(),
            blacklist_remaining_ms: remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_failure_does_not_blacklist() {
        let tracker = HealthTracker::new(60);
        tracker.record_failure("a");
        assert!(!tracker.is_blacklisted("a"));
    }

    #[test]
    fn two_consecutive_failures_blacklist() {
        let tracker = HealthTracker::new(60);
        tracker.record_failure("a");
        tracker.record_failure("a");
        assert!(tracker.is_blacklisted("a"));
        assert!(!tracker.is_blacklisted("b"));
    }

    #[test]
    fn success_resets_streak() {
        let tracker = HealthTracker::new(60);
        tracker.record_failure("a");
        tracker.record_success("a");
        tracker.record_failure("a");
        assert!(!tracker.is_blacklisted("a"));
    }

    #[test]
    fn blacklist_expires() {
        let tracker = HealthTracker::new(0);
        tracker.record_failure("a");
        tracker.record_failure("a");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!tracker.is_blacklisted("a"));
    }

    #[test]
    fn snapshot_reports_remaining() {
        let tracker = HealthTracker::new(60);
        tracker.record_failure("a");
        tracker.record_failure("a");
        let snap = tracker.snapshot("a");
        assert!(snap.blacklisted);
        assert!(snap.blacklist_remaining_ms.unwrap() > 0);
        assert_eq!(snap.consecutive_failures, 2);
    }
}
