//! Environment variables forming the host-to-plugin negotiation contract.
//!
//! The host injects these before spawning a plugin so the plugin can decide
//! which versions to announce and where to listen before it prints its
//! handshake line.

/// Comma-separated core protocol versions the host accepts.
pub const CORE_PROTOCOL_VERSIONS: &str = "TETHER_CORE_PROTOCOL_VERSIONS";

/// Comma-separated application protocol versions the host has plugin sets
/// for, highest first.
pub const APP_PROTOCOL_VERSIONS: &str = "TETHER_APP_PROTOCOL_VERSIONS";

/// Lowest TCP port a plugin may bind.
pub const MIN_PORT: &str = "TETHER_MIN_PORT";

/// Highest TCP port a plugin may bind.
pub const MAX_PORT: &str = "TETHER_MAX_PORT";

/// Directory in which a plugin should create its Unix socket.
pub const UNIX_SOCKET_DIR: &str = "TETHER_UNIX_SOCKET_DIR";

/// Log format the host asks a plugin to use for its stderr lines; one of the
/// [`LogFormat`](crate::LogFormat) names.
pub const LOG_FORMAT: &str = "TETHER_LOG_FORMAT";

/// Renders a version list in the comma-separated form used by the variables
/// above.
///
/// ```
/// assert_eq!(tether_config::env::join_versions(&[3, 2, 1]), "3,2,1");
/// ```
#[must_use]
pub fn join_versions(versions: &[u32]) -> String {
    versions
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma-separated version list, skipping blank or invalid entries.
///
/// ```
/// assert_eq!(tether_config::env::split_versions("2, 1,x,"), vec![2, 1]);
/// ```
#[must_use]
pub fn split_versions(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .collect()
}
