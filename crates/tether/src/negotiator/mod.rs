//! Connection establishment to a plugin endpoint.
//!
//! A plugin may print its handshake line a moment before its listener
//! accepts, so dialing retries with a doubling backoff inside a bounded
//! window. Cancellation of the caller's [`Context`] stops retries immediately.

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_config::{SocketEndpoint, Timeouts};
use thiserror::Error;
use tracing::{debug, info};

use crate::context::{Context, ContextError};
use crate::transport::Connection;

/// Log target for connection negotiation.
pub(crate) const NEGOTIATOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::negotiator");

/// Lower bound on a single TCP connect attempt.
const MIN_ATTEMPT: Duration = Duration::from_millis(1);

/// Wraps a raw connection in TLS using the certificate the plugin announced.
#[cfg_attr(test, mockall::automock)]
pub trait TlsUpgrade: Send + Sync {
    /// Performs the upgrade.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the TLS handshake fails or the certificate
    /// is rejected.
    fn upgrade(
        &self,
        stream: Connection,
        endpoint: &SocketEndpoint,
        certificate: &[u8],
    ) -> io::Result<Connection>;
}

/// Errors raised while connecting to a plugin.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No attempt succeeded inside the dial window.
    #[error(
        "could not connect to plugin at {endpoint} after {attempts} attempts in {window_ms}ms"
    )]
    Timeout {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Length of the dial window.
        window_ms: u64,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: Option<io::Error>,
    },
    /// The caller's context stopped dialing.
    #[error("dialing plugin at {endpoint} stopped: {reason}")]
    Cancelled {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Why the context stopped.
        #[source]
        reason: ContextError,
    },
    /// The plugin announced a certificate but no TLS upgrade is configured.
    #[error("plugin at {endpoint} requires TLS but no TLS upgrade is configured")]
    TlsUnavailable {
        /// Endpoint that was dialed.
        endpoint: String,
    },
    /// The TLS upgrade failed.
    #[error("TLS upgrade with plugin at {endpoint} failed: {source}")]
    Tls {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Upgrade error.
        #[source]
        source: io::Error,
    },
    /// Unix sockets are unavailable on this platform.
    #[error("cannot dial unix endpoint {endpoint} on this platform")]
    UnsupportedUnix {
        /// Endpoint that was dialed.
        endpoint: String,
    },
}

/// Retry and security policy for [`dial`].
#[derive(Clone)]
pub struct DialPolicy {
    window: Duration,
    backoff: Duration,
    backoff_max: Duration,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl DialPolicy {
    /// Builds a policy from the configured timeouts, without TLS.
    #[must_use]
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            window: timeouts.dial_window(),
            backoff: timeouts.dial_backoff(),
            backoff_max: timeouts.dial_backoff_max(),
            tls: None,
        }
    }

    /// Installs the TLS upgrade used when the plugin announces a certificate.
    #[must_use]
    pub fn with_tls(mut self, tls: Option<Arc<dyn TlsUpgrade>>) -> Self {
        self.tls = tls;
        self
    }

    /// Total dial window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self::from_timeouts(&Timeouts::default())
    }
}

impl fmt::Debug for DialPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialPolicy")
            .field("window", &self.window)
            .field("backoff", &self.backoff)
            .field("backoff_max", &self.backoff_max)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Connects to `endpoint`, retrying until the policy window closes.
///
/// When `certificate` is present the connection is handed to the policy's
/// [`TlsUpgrade`]; without one the dial fails before any attempt is made.
///
/// # Errors
///
/// Returns a [`ConnectError`] when the window closes without a connection,
/// the context stops dialing, or TLS is required and unavailable or fails.
pub fn dial(
    endpoint: &SocketEndpoint,
    certificate: Option<&[u8]>,
    policy: &DialPolicy,
    ctx: &Context,
) -> Result<Connection, ConnectError> {
    let tls = match (certificate, &policy.tls) {
        (Some(_), None) => {
            return Err(ConnectError::TlsUnavailable {
                endpoint: endpoint.to_string(),
            });
        }
        (Some(certificate), Some(tls)) => Some((certificate, tls)),
        (None, _) => None,
    };

    let connection = connect_with_retry(endpoint, policy, ctx)?;
    let Some((certificate, tls)) = tls else {
        return Ok(connection);
    };
    debug!(target: NEGOTIATOR_TARGET, %endpoint, "upgrading plugin connection to TLS");
    tls.upgrade(connection, endpoint, certificate)
        .map_err(|source| ConnectError::Tls {
            endpoint: endpoint.to_string(),
            source,
        })
}

fn connect_with_retry(
    endpoint: &SocketEndpoint,
    policy: &DialPolicy,
    ctx: &Context,
) -> Result<Connection, ConnectError> {
    let cancelled = |reason| ConnectError::Cancelled {
        endpoint: endpoint.to_string(),
        reason,
    };
    let started = Instant::now();
    let deadline = started + policy.window;
    let mut backoff = policy.backoff;
    let mut attempts = 0_u32;
    let mut last = None;

    loop {
        ctx.check().map_err(cancelled)?;
        attempts = attempts.saturating_add(1);
        let budget = ctx.bound(deadline.saturating_duration_since(Instant::now()));
        match connect_once(endpoint, budget) {
            Ok(connection) => {
                info!(
                    target: NEGOTIATOR_TARGET,
                    %endpoint,
                    attempts,
                    elapsed_ms = millis(started.elapsed()),
                    "connected to plugin"
                );
                return Ok(connection);
            }
            Err(AttemptError::Unsupported) => {
                return Err(ConnectError::UnsupportedUnix {
                    endpoint: endpoint.to_string(),
                });
            }
            Err(AttemptError::Io(error)) => {
                debug!(target: NEGOTIATOR_TARGET, %endpoint, attempts, %error, "dial attempt failed");
                last = Some(error);
            }
        }

        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(ConnectError::Timeout {
                endpoint: endpoint.to_string(),
                window_ms: millis(policy.window),
                attempts,
                last,
            });
        }
        ctx.sleep(backoff.min(left)).map_err(cancelled)?;
        backoff = backoff.saturating_mul(2).min(policy.backoff_max);
    }
}

enum AttemptError {
    Io(io::Error),
    #[cfg_attr(unix, expect(dead_code, reason = "unix sockets are always available on unix"))]
    Unsupported,
}

impl From<io::Error> for AttemptError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

fn connect_once(endpoint: &SocketEndpoint, budget: Duration) -> Result<Connection, AttemptError> {
    match endpoint {
        SocketEndpoint::Tcp { host, port } => {
            let mut last = None;
            for addr in (host.as_str(), *port).to_socket_addrs()? {
                match TcpStream::connect_timeout(&addr, budget.max(MIN_ATTEMPT)) {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return Ok(Connection::Tcp(stream));
                    }
                    Err(error) => last = Some(error),
                }
            }
            Err(AttemptError::Io(last.unwrap_or_else(|| {
                io::Error::from(io::ErrorKind::AddrNotAvailable)
            })))
        }
        #[cfg(unix)]
        SocketEndpoint::Unix { path } => Ok(Connection::Unix(UnixStream::connect(path)?)),
        #[cfg(not(unix))]
        SocketEndpoint::Unix { .. } => Err(AttemptError::Unsupported),
    }
}
