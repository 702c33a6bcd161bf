use std::time::Duration;
use tracing::warn;

/// Decision returned by the restart policy after a failed launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `next_attempt` (1-based).
    Retry { next_attempt: u32, delay: Duration },
    /// All attempts are used up; give the restart up.
    GiveUp,
}

/// Bounded restart policy with exponential backoff.
///
/// Attempt `n` failing schedules a wait of `base * 2^(n-1)` before attempt
/// `n + 1`. The final attempt failing yields `GiveUp` with no wait.
pub struct RestartPolicy {
    max_attempts: u32,
    base_backoff_secs: u64,
    current_attempt: u32,
}

impl RestartPolicy {
    /// Create a new restart policy from config values.
    pub fn new(max_attempts: u32, base_backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            base_backoff_secs,
            current_attempt: 0,
        }
    }

    /// Begin the next attempt. Returns its 1-based number, or None once exhausted.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }
        self.current_attempt += 1;
        Some(self.current_attempt)
    }

    /// Record that the current attempt failed and decide what comes next.
    pub fn on_failure(&self) -> RetryDecision {
        if self.current_attempt >= self.max_attempts {
            warn!(
                attempts = self.current_attempt,
                max_attempts = self.max_attempts,
                "restart attempts exhausted"
            );
            return RetryDecision::GiveUp;
        }

        let delay_secs = backoff_delay(self.base_backoff_secs, self.current_attempt);
        RetryDecision::Retry {
            next_attempt: self.current_attempt + 1,
            delay: Duration::from_secs(delay_secs),
        }
    }

    /// Attempts made so far (0 = none yet).
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Backoff after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
///
/// Saturates instead of overflowing for absurd attempt counts.
pub fn backoff_delay(base_secs: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let shift = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_secs.saturating_mul(shift)
}
