//! Handshake policy shared by host and plugin.

use serde::{Deserialize, Serialize};

/// Agreement a host and its plugins are built against.
///
/// The magic cookie is not a security measure. It lets a plugin binary
/// notice that it was started by hand rather than by a host and print a
/// helpful message instead of a handshake line nobody reads. An empty key
/// disables the check on both sides. The default policy speaks application
/// version 1 with no cookie.
///
/// # Example
///
/// ```
/// use tether::handshake::HandshakeConfig;
///
/// let config = HandshakeConfig::new(2, "KV_PLUGIN", "a8c1f0");
/// assert!(config.cookie_matches(Some("a8c1f0")));
/// assert!(!config.cookie_matches(None));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HandshakeConfig {
    app_version: u32,
    magic_cookie_key: String,
    magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new(1, "", "")
    }
}

impl HandshakeConfig {
    /// Builds a handshake policy.
    #[must_use]
    pub fn new(
        app_version: u32,
        magic_cookie_key: impl Into<String>,
        magic_cookie_value: impl Into<String>,
    ) -> Self {
        Self {
            app_version,
            magic_cookie_key: magic_cookie_key.into(),
            magic_cookie_value: magic_cookie_value.into(),
        }
    }

    /// Application protocol version used when no versioned plugin sets are
    /// configured.
    #[must_use]
    pub const fn app_version(&self) -> u32 {
        self.app_version
    }

    /// Environment variable carrying the cookie; empty when disabled.
    #[must_use]
    pub const fn magic_cookie_key(&self) -> &str {
        self.magic_cookie_key.as_str()
    }

    /// Expected cookie value.
    #[must_use]
    pub const fn magic_cookie_value(&self) -> &str {
        self.magic_cookie_value.as_str()
    }

    /// Whether a cookie is configured at all.
    #[must_use]
    pub const fn has_cookie(&self) -> bool {
        !self.magic_cookie_key.is_empty()
    }

    /// Checks the cookie a plugin found in its environment.
    #[must_use]
    pub fn cookie_matches(&self, found: Option<&str>) -> bool {
        !self.has_cookie() || found == Some(self.magic_cookie_value.as_str())
    }
}
