//! Reconnection policy for the collaboration socket.
//!
//! Exponential backoff with a bounded number of attempts. Once the budget is
//! spent the client stops retrying and switches to the fallback store.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Delay before reconnect attempt number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Retry bookkeeping for one session.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Attempts scheduled since the last successful connection
    pub attempts: u32,
    /// Delay chosen for the most recent attempt
    pub current_delay: Option<Duration>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the next attempt after a failure.
    ///
    /// Returns the delay to wait, or `None` once `max_attempts` have already
    /// been scheduled. The attempt counter does not advance past the budget.
    pub fn schedule_reconnect(&mut self, config: &ReconnectConfig) -> Option<Duration> {
        if self.exceeded_max_attempts(config) {
            self.current_delay = None;
            return None;
        }
        self.attempts += 1;
        let delay = calculate_backoff(self.attempts, config);
        self.current_delay = Some(delay);
        Some(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = None;
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}
