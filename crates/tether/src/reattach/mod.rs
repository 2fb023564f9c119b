//! Serialisable descriptor for reconnecting to an already-running plugin.
//!
//! A [`ReattachConfig`] is produced once a spawned plugin is connected and can
//! be persisted (for example as JSON) so a later host process can adopt the
//! same plugin without spawning a new one.

use serde::{Deserialize, Serialize};
use tether_config::SocketEndpoint;

use crate::handshake::{CORE_PROTOCOL_VERSION, ProtocolKind};

/// How a reattaching client verifies that the plugin is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessTest {
    /// Probe the process id with a null signal.
    #[default]
    Signal,
    /// Issue a control ping over the connection instead of probing the pid.
    ///
    /// Useful when the plugin runs in a different pid namespace, such as a
    /// container or a debugger session.
    Ping,
}

/// Reattach descriptor for a running plugin.
///
/// `owned` decides whether a client adopting the plugin may terminate it. A
/// descriptor produced by a spawning client is not owned; the adopting host
/// opts in with [`ReattachConfig::with_ownership`].
///
/// # Example
///
/// ```
/// use tether::{ProtocolKind, ReattachConfig};
/// use tether_config::SocketEndpoint;
///
/// let config = ReattachConfig::new(
///     4242,
///     SocketEndpoint::tcp("127.0.0.1", 9000),
///     ProtocolKind::NetRpc,
///     1,
/// );
/// let json = serde_json::to_string(&config).expect("serialise");
/// let back: ReattachConfig = serde_json::from_str(&json).expect("deserialise");
/// assert_eq!(back, config);
/// assert!(!back.owned());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReattachConfig {
    pid: u32,
    endpoint: SocketEndpoint,
    protocol: ProtocolKind,
    #[serde(default = "default_core_version")]
    core_version: u32,
    app_version: u32,
    #[serde(default)]
    owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    test: Option<LivenessTest>,
}

const fn default_core_version() -> u32 {
    CORE_PROTOCOL_VERSION
}

impl ReattachConfig {
    /// Builds a descriptor for a plugin speaking the current core version.
    #[must_use]
    pub const fn new(
        pid: u32,
        endpoint: SocketEndpoint,
        protocol: ProtocolKind,
        app_version: u32,
    ) -> Self {
        Self {
            pid,
            endpoint,
            protocol,
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            owned: false,
            test: None,
        }
    }

    /// Records the core protocol version negotiated with the plugin.
    #[must_use]
    pub const fn with_core_version(mut self, core_version: u32) -> Self {
        self.core_version = core_version;
        self
    }

    /// Grants or withdraws authority to terminate the plugin on kill.
    #[must_use]
    pub const fn with_ownership(mut self, owned: bool) -> Self {
        self.owned = owned;
        self
    }

    /// Selects how liveness is verified on reattach.
    #[must_use]
    pub const fn with_test(mut self, test: LivenessTest) -> Self {
        self.test = Some(test);
        self
    }

    /// Process id of the plugin.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Endpoint the plugin listens on.
    #[must_use]
    pub const fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Wire protocol negotiated with the plugin.
    #[must_use]
    pub const fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Core protocol version negotiated with the plugin.
    #[must_use]
    pub const fn core_version(&self) -> u32 {
        self.core_version
    }

    /// Application protocol version negotiated with the plugin.
    #[must_use]
    pub const fn app_version(&self) -> u32 {
        self.app_version
    }

    /// Whether an adopting client may terminate the plugin.
    #[must_use]
    pub const fn owned(&self) -> bool {
        self.owned
    }

    /// Liveness verification strategy; the signal probe when unset.
    #[must_use]
    pub fn test(&self) -> LivenessTest {
        self.test.unwrap_or_default()
    }
}
