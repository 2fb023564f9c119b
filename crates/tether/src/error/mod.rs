//! Error taxonomy for the lifecycle controller.
//!
//! Every failure of [`Client::start`](crate::Client::start) is terminal for
//! that client. [`ClientError::kind`] folds the variants into the categories
//! a host needs for diagnostics, most importantly separating an incompatible
//! plugin from an unreachable one.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::client::ClientState;
use crate::context::ContextError;
use crate::handshake::HandshakeError;
use crate::negotiator::ConnectError;
use crate::rpc::RpcError;
use crate::supervisor::{ProbeError, SpawnError};

/// Invalid [`ClientConfig`](crate::ClientConfig).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Neither a command nor a reattach descriptor was given.
    #[error("client needs either a plugin command or a reattach descriptor")]
    MissingSource,
    /// Both a command and a reattach descriptor were given.
    #[error("client cannot both spawn a plugin and reattach to one")]
    ConflictingSource,
    /// No plugin set was configured.
    #[error("client has no plugins to dispense")]
    EmptyPluginSet,
    /// No protocol is allowed.
    #[error("client allows no plugin protocols")]
    NoAllowedProtocols,
    /// No core protocol version is supported.
    #[error("client supports no core protocol versions")]
    NoCoreVersions,
    /// The TCP port range is empty.
    #[error("port range {min}-{max} is empty")]
    InvalidPortRange {
        /// Lowest port.
        min: u16,
        /// Highest port.
        max: u16,
    },
}

/// A lifecycle operation was invoked in a state that does not allow it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MisuseError {
    /// `start` was called on a client that already left `Unstarted`.
    #[error("client was already started (state: {state}); construct a new client to retry")]
    AlreadyStarted {
        /// State at the time of the call.
        state: ClientState,
    },
    /// The client has not connected yet.
    #[error("client is not connected (state: {state})")]
    NotConnected {
        /// State at the time of the call.
        state: ClientState,
    },
    /// The client reached a terminal state.
    #[error("client is {state} and cannot be used")]
    Terminal {
        /// State at the time of the call.
        state: ClientState,
    },
}

/// Categories of [`ClientError`] a host can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientErrorKind {
    /// The configuration is invalid.
    Config,
    /// The plugin speaks an incompatible or malformed handshake.
    Incompatible,
    /// The plugin could not be started, reached, or found alive.
    Unreachable,
    /// The caller cancelled or the deadline passed.
    Cancelled,
    /// The API was used out of order.
    Misuse,
    /// The background watcher could not observe the plugin.
    Watcher,
    /// The RPC collaborator failed.
    Rpc,
}

/// Errors raised by [`Client`](crate::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The configuration was rejected before anything started.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The plugin process could not be created.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The handshake was malformed, incompatible, or never arrived.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// The plugin's endpoint could not be dialed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// The reattach target is not running.
    #[error("plugin process {pid} is not alive")]
    ProcessNotAlive {
        /// Process id from the reattach descriptor.
        pid: u32,
    },
    /// The liveness probe could not decide.
    #[error("could not check plugin process {pid}: {source}")]
    Probe {
        /// Probed process id.
        pid: u32,
        /// Probe failure.
        #[source]
        source: ProbeError,
    },
    /// Supervision of an adopted process could not start.
    #[error("could not supervise plugin process {pid}: {source}")]
    Adopt {
        /// Adopted process id.
        pid: u32,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// The caller's context stopped the operation.
    #[error("operation stopped: {0}")]
    Cancelled(#[from] ContextError),
    /// The operation is not valid in the current state.
    #[error(transparent)]
    Misuse(#[from] MisuseError),
    /// The background watcher failed to observe the process.
    #[error("lost track of plugin process {pid}: {source}")]
    Watcher {
        /// Watched process id.
        pid: u32,
        /// Error recorded by the watcher.
        #[source]
        source: Arc<io::Error>,
    },
    /// The RPC layer failed during startup.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ClientError {
    /// Category of this error.
    #[must_use]
    pub const fn kind(&self) -> ClientErrorKind {
        match self {
            Self::Config(_) => ClientErrorKind::Config,
            Self::Handshake(
                HandshakeError::ExitedBeforeHandshake { .. } | HandshakeError::Timeout { .. },
            )
            | Self::Spawn(_)
            | Self::Connect(ConnectError::Timeout { .. } | ConnectError::UnsupportedUnix { .. })
            | Self::ProcessNotAlive { .. }
            | Self::Probe { .. }
            | Self::Adopt { .. } => ClientErrorKind::Unreachable,
            Self::Cancelled(_) | Self::Connect(ConnectError::Cancelled { .. }) => {
                ClientErrorKind::Cancelled
            }
            Self::Handshake(_) | Self::Connect(_) => ClientErrorKind::Incompatible,
            Self::Misuse(_) => ClientErrorKind::Misuse,
            Self::Watcher { .. } => ClientErrorKind::Watcher,
            Self::Rpc(_) => ClientErrorKind::Rpc,
        }
    }

    /// Whether the plugin is incompatible with this host.
    #[must_use]
    pub const fn is_incompatible(&self) -> bool {
        matches!(self.kind(), ClientErrorKind::Incompatible)
    }

    /// Whether the plugin could not be started or reached.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self.kind(), ClientErrorKind::Unreachable)
    }
}

#[cfg(test)]
mod tests;
