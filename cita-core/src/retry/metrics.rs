use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::workflow::Outcome;

/// Per-run counters, one per outcome kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub rejected: u64,
    pub rate_limited: u64,
    pub session_timeouts: u64,
    pub no_transition: u64,
    pub validation_failures: u64,
    pub step_failures: u64,
    pub transport_errors: u64,
    pub backoff_millis: u64,
    pub cooloff_millis: u64,
}

impl RunMetrics {
    pub fn record_outcome(&mut self, outcome: &Outcome) {
        self.attempts = self.attempts.saturating_add(1);
        let counter = match outcome {
            Outcome::Success => &mut self.successes,
            Outcome::Rejected => &mut self.rejected,
            Outcome::RateLimited => &mut self.rate_limited,
            Outcome::SessionTimeout => &mut self.session_timeouts,
            Outcome::NoTransition => &mut self.no_transition,
            Outcome::ValidationFailed => &mut self.validation_failures,
            Outcome::StepFailed(_) => &mut self.step_failures,
            Outcome::TransportError(_) => &mut self.transport_errors,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_backoff(&mut self, delay: Duration) {
        self.backoff_millis = self.backoff_millis.saturating_add(millis(delay));
    }

    pub fn record_cooloff(&mut self, delay: Duration) {
        self.cooloff_millis = self.cooloff_millis.saturating_add(millis(delay));
    }

    pub fn total_wait(&self) -> Duration {
        Duration::from_millis(self.backoff_millis.saturating_add(self.cooloff_millis))
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
