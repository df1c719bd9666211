//! Per-source fetch state.
//!
//! Tracks the `IDLE → FETCHING → (OK | TRANSIENT_FAIL | HARD_FAIL)` cycle.
//! Hard failures disable the source for an interval that doubles up to one
//! hour; the first success resets everything.

use std::time::{Duration, Instant};

const INITIAL_DISABLE: Duration = Duration::from_secs(5 * 60);
const MAX_DISABLE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct SourceState {
    consecutive_failures: u32,
    disable_interval: Duration,
    disabled_until: Option<Instant>,
}

impl Default for SourceState {
    fn default() -> Self {
        SourceState {
            consecutive_failures: 0,
            disable_interval: INITIAL_DISABLE,
            disabled_until: None,
        }
    }
}

impl SourceState {
    /// Whether the source may be fetched right now.
    pub fn ready(&self, now: Instant) -> bool {
        match self.disabled_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.disable_interval = INITIAL_DISABLE;
        self.disabled_until = None;
    }

    pub fn on_transient_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Non-recoverable failure (bad status, unparseable document): park the
    /// source and double the interval for next time.
    pub fn on_hard_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.disabled_until = Some(now + self.disable_interval);
        self.disable_interval = (self.disable_interval * 2).min(MAX_DISABLE);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
