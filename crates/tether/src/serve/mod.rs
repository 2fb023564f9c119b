//! Plugin-side bootstrap.
//!
//! A plugin binary calls [`serve`] from `main`. It checks that a host started
//! it, picks the application version to announce, binds a listener, prints
//! the handshake line on stdout, and serves RPC until the host asks it to
//! quit.

use std::collections::BTreeMap;
use std::io::{self, Write};

use thiserror::Error;
use tracing::{debug, info};

use tether_config::env;

use crate::handshake::{CORE_PROTOCOL_VERSION, HandshakeConfig, HandshakeLine, ProtocolKind};
use crate::rpc::RpcServer;
use crate::signal::ExitSignal;
use crate::transport::{ListenerError, ListenerOptions, PluginListener};

const SERVE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::serve");

/// Errors raised while bootstrapping a plugin.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The magic cookie is missing or wrong.
    #[error(
        "this binary is a plugin and is not meant to be run directly; \
         start it through its host (missing or invalid {key})"
    )]
    NotLaunchedByHost {
        /// Environment variable that should carry the cookie.
        key: String,
    },
    /// No RPC server was registered.
    #[error("no rpc server registered for any application version")]
    NoServers,
    /// The requested protocol has no server implementation here.
    #[error("protocol '{protocol}' is not served by this crate")]
    UnsupportedProtocol {
        /// Requested protocol.
        protocol: ProtocolKind,
    },
    /// Binding the listener failed.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// Writing the handshake line failed.
    #[error("failed to announce handshake: {0}")]
    Announce(#[source] io::Error),
}

/// Everything a plugin needs to serve its host.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    handshake: HandshakeConfig,
    servers: BTreeMap<u32, RpcServer>,
    listener: ListenerOptions,
    protocol: ProtocolKind,
}

impl ServeConfig {
    /// Serves `server` as the handshake's application version over TCP.
    #[must_use]
    pub fn new(handshake: HandshakeConfig, server: RpcServer) -> Self {
        let mut servers = BTreeMap::new();
        servers.insert(handshake.app_version(), server);
        Self {
            handshake,
            servers,
            listener: ListenerOptions::tcp(),
            protocol: ProtocolKind::NetRpc,
        }
    }

    /// Adds a server for another application version.
    #[must_use]
    pub fn with_version(mut self, app_version: u32, server: RpcServer) -> Self {
        self.servers.insert(app_version, server);
        self
    }

    /// Overrides where the plugin listens.
    #[must_use]
    pub fn with_listener(mut self, listener: ListenerOptions) -> Self {
        self.listener = listener;
        self
    }

    /// Overrides the announced protocol.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    /// Picks the highest application version both sides support, falling
    /// back to the highest local version when the host offers none of ours.
    fn negotiate(&self, offered: &[u32]) -> Option<u32> {
        self.servers
            .keys()
            .rev()
            .find(|version| offered.contains(version))
            .or_else(|| self.servers.keys().next_back())
            .copied()
    }
}

/// A plugin that has announced itself and is ready to serve.
#[derive(Debug)]
pub struct Announced {
    listener: PluginListener,
    server: RpcServer,
    handshake: HandshakeLine,
}

impl Announced {
    /// The line that was printed.
    #[must_use]
    pub const fn handshake(&self) -> &HandshakeLine {
        &self.handshake
    }

    /// Serves until `shutdown` fires or the host sends `quit`.
    pub fn run(self, shutdown: &ExitSignal) {
        self.server.serve(&self.listener, shutdown);
        debug!(target: SERVE_TARGET, "plugin finished serving");
    }
}

/// Runs the plugin bootstrap against the real process environment and
/// stdout, returning once the host asks the plugin to quit.
///
/// # Errors
///
/// Returns a [`ServeError`] when the cookie check fails, no server matches,
/// the listener cannot be bound, or stdout is closed.
pub fn serve(config: &ServeConfig) -> Result<(), ServeError> {
    let options = config.listener.clone().with_host_environment();
    let resolved = config.clone().with_listener(options);
    let announced = announce(
        &resolved,
        |key| std::env::var(key).ok(),
        &mut io::stdout().lock(),
    )?;
    announced.run(&ExitSignal::new());
    Ok(())
}

/// Validates the environment, binds the listener, and writes the handshake
/// line to `out`.
///
/// `lookup` reads environment variables; [`serve`] passes the process
/// environment.
///
/// # Errors
///
/// As [`serve`].
pub fn announce<F, W>(
    config: &ServeConfig,
    lookup: F,
    out: &mut W,
) -> Result<Announced, ServeError>
where
    F: Fn(&str) -> Option<String>,
    W: Write,
{
    let cookie_key = config.handshake.magic_cookie_key();
    if !config
        .handshake
        .cookie_matches(lookup(cookie_key).as_deref())
    {
        return Err(ServeError::NotLaunchedByHost {
            key: cookie_key.to_owned(),
        });
    }
    if config.protocol != ProtocolKind::NetRpc {
        return Err(ServeError::UnsupportedProtocol {
            protocol: config.protocol,
        });
    }

    let offered = lookup(env::APP_PROTOCOL_VERSIONS)
        .map(|raw| env::split_versions(&raw))
        .unwrap_or_default();
    let app_version = config.negotiate(&offered).ok_or(ServeError::NoServers)?;
    let server = config
        .servers
        .get(&app_version)
        .cloned()
        .ok_or(ServeError::NoServers)?;

    let listener = PluginListener::bind(&config.listener)?;
    let handshake = HandshakeLine::new(
        CORE_PROTOCOL_VERSION,
        app_version,
        listener.endpoint().clone(),
        config.protocol,
    );
    writeln!(out, "{handshake}").map_err(ServeError::Announce)?;
    out.flush().map_err(ServeError::Announce)?;
    info!(
        target: SERVE_TARGET,
        app_version,
        endpoint = %listener.endpoint(),
        "plugin announced"
    );
    Ok(Announced {
        listener,
        server,
        handshake,
    })
}
