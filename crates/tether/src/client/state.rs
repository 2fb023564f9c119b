//! Lifecycle states of a [`Client`](super::Client).

use std::fmt;

/// Where a client is in its lifecycle.
///
/// `Unstarted → Starting → Connected → Exited`, with `Killed` reachable from
/// any non-terminal state and `Failed` recorded when `start` returns an
/// error. `Exited`, `Killed`, and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientState {
    /// Configured but not started.
    #[default]
    Unstarted,
    /// `start` is running.
    Starting,
    /// Connected and serving calls.
    Connected,
    /// The plugin process exited.
    Exited,
    /// The caller killed the client.
    Killed,
    /// `start` failed.
    Failed,
}

impl ClientState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Failed)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
