//! Public types for the agent.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use pullwire_transfer::FlowConfig;

/// Everything an [`Agent`](crate::Agent) needs to run.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// WebSocket URL of the relay, e.g. `ws://relay:8080/ws`.
    pub server_url: String,
    pub client_id: String,
    /// The file served for every download request.
    pub file_path: PathBuf,
    pub flow: FlowConfig,
    pub reconnect: ReconnectConfig,
}

/// Reconnect schedule.
///
/// The delay ceiling grows by `backoff_factor` per failed attempt, from
/// `initial_delay` up to `max_delay`; the actual delay is drawn from the
/// upper half of the ceiling so that agents cut off together do not all
/// dial back in the same instant.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Largest delay allowed before reconnect `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1).min(64) as i32;
        let grown = self.initial_delay.as_secs_f64() * self.backoff_factor.max(1.0).powi(steps);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before reconnect `attempt`, uniform in `[ceiling / 2, ceiling]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        rand::rng().random_range(ceiling / 2..=ceiling)
    }

    /// Whether a finished connection proved healthy enough to restart the
    /// schedule from `initial_delay`.
    ///
    /// A connection that served a transfer, or stayed up for at least
    /// `max_delay`, counts. One the relay drops right after registering
    /// does not, so a flapping relay keeps getting longer pauses.
    pub fn is_stable(&self, uptime: Duration, transfers_served: u64) -> bool {
        transfers_served > 0 || uptime >= self.max_delay
    }
}
