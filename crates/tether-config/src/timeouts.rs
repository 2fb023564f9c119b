//! Timing policy for plugin startup, dialing, and teardown.
//!
//! None of these values are dictated by the handshake protocol; the right
//! numbers depend on how slow a deployment's plugins are to start and how
//! long they need to flush state on termination.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wait for the handshake line.
pub const DEFAULT_STARTUP_MS: u64 = 60_000;
/// Default total window for connection attempts after the handshake.
pub const DEFAULT_DIAL_WINDOW_MS: u64 = 5_000;
/// Default delay before the second connection attempt.
pub const DEFAULT_DIAL_BACKOFF_MS: u64 = 25;
/// Default ceiling for the doubling backoff between connection attempts.
pub const DEFAULT_DIAL_BACKOFF_MAX_MS: u64 = 500;
/// Default grace period between the termination signal and a forced kill.
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;

/// Timing policy applied by the lifecycle controller.
///
/// Values are stored in milliseconds so the type serialises into plain
/// integers; accessors return [`Duration`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tether_config::Timeouts;
///
/// let timeouts = Timeouts::default().with_startup(Duration::from_secs(5));
/// assert_eq!(timeouts.startup(), Duration::from_secs(5));
/// assert_eq!(timeouts.kill_grace(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    startup_ms: u64,
    dial_window_ms: u64,
    dial_backoff_ms: u64,
    dial_backoff_max_ms: u64,
    kill_grace_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup_ms: DEFAULT_STARTUP_MS,
            dial_window_ms: DEFAULT_DIAL_WINDOW_MS,
            dial_backoff_ms: DEFAULT_DIAL_BACKOFF_MS,
            dial_backoff_max_ms: DEFAULT_DIAL_BACKOFF_MAX_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Timeouts {
    /// Maximum wait for the plugin's handshake line.
    #[must_use]
    pub const fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    /// Total window in which connection attempts are retried.
    #[must_use]
    pub const fn dial_window(&self) -> Duration {
        Duration::from_millis(self.dial_window_ms)
    }

    /// Delay before the second connection attempt; doubles afterwards.
    #[must_use]
    pub const fn dial_backoff(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_ms)
    }

    /// Upper bound for the doubling backoff.
    #[must_use]
    pub const fn dial_backoff_max(&self) -> Duration {
        Duration::from_millis(self.dial_backoff_max_ms)
    }

    /// Grace period after the termination signal before a forced kill.
    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Overrides the handshake wait.
    #[must_use]
    pub fn with_startup(mut self, value: Duration) -> Self {
        self.startup_ms = millis(value);
        self
    }

    /// Overrides the dial retry window.
    #[must_use]
    pub fn with_dial_window(mut self, value: Duration) -> Self {
        self.dial_window_ms = millis(value);
        self
    }

    /// Overrides the initial dial backoff and its ceiling.
    #[must_use]
    pub fn with_dial_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.dial_backoff_ms = millis(initial);
        self.dial_backoff_max_ms = millis(max.max(initial));
        self
    }

    /// Overrides the kill grace period.
    #[must_use]
    pub fn with_kill_grace(mut self, value: Duration) -> Self {
        self.kill_grace_ms = millis(value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.startup(), Duration::from_secs(60));
        assert_eq!(timeouts.dial_window(), Duration::from_secs(5));
        assert_eq!(timeouts.dial_backoff(), Duration::from_millis(25));
        assert_eq!(timeouts.dial_backoff_max(), Duration::from_millis(500));
        assert_eq!(timeouts.kill_grace(), Duration::from_secs(2));
    }

    #[test]
    fn backoff_ceiling_never_drops_below_initial() {
        let timeouts = Timeouts::default()
            .with_dial_backoff(Duration::from_millis(300), Duration::from_millis(100));
        assert_eq!(timeouts.dial_backoff_max(), Duration::from_millis(300));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let timeouts: Timeouts =
            serde_json::from_str(r#"{"startup_ms": 1500}"#).expect("deserialise timeouts");
        assert_eq!(timeouts.startup(), Duration::from_millis(1500));
        assert_eq!(timeouts.kill_grace(), Duration::from_secs(2));
    }
}
