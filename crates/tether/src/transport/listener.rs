//! Plugin-side listener that produces the endpoint announced in the
//! handshake line.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use camino::{Utf8Path, Utf8PathBuf};
use tether_config::{NetworkKind, SocketEndpoint, env};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Connection, TRANSPORT_TARGET};

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(unix)]
static SOCKET_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Errors surfaced while binding a plugin listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The host name did not resolve.
    #[error("failed to resolve TCP address {host}:{port}: {source}")]
    Resolve {
        /// Host that was resolved.
        host: String,
        /// Port that was resolved.
        port: u16,
        /// Resolver error.
        #[source]
        source: io::Error,
    },
    /// Binding a TCP port failed for a reason other than it being taken.
    #[error("failed to bind TCP listener at {addr}: {source}")]
    BindTcp {
        /// Address that failed to bind.
        addr: SocketAddr,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// Every port in the configured range is taken.
    #[error("no free TCP port between {min} and {max}")]
    NoPortAvailable {
        /// Lowest port tried.
        min: u16,
        /// Highest port tried.
        max: u16,
    },
    /// The configured range is empty.
    #[error("invalid port range {min}..={max}")]
    InvalidPortRange {
        /// Configured lower bound.
        min: u16,
        /// Configured upper bound.
        max: u16,
    },
    /// The socket directory is not valid UTF-8.
    #[error("unix socket directory {path} is not valid UTF-8")]
    NonUtf8Path {
        /// Lossy rendering of the directory.
        path: String,
    },
    /// Binding the Unix socket failed.
    #[cfg(unix)]
    #[error("failed to bind unix listener at {path}: {source}")]
    BindUnix {
        /// Socket path.
        path: Utf8PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// The socket path exists and accepts connections.
    #[cfg(unix)]
    #[error("existing unix socket {path} is already in use")]
    UnixInUse {
        /// Socket path.
        path: Utf8PathBuf,
    },
    /// The socket path exists and is not a socket.
    #[cfg(unix)]
    #[error("unix socket path {path} is not a socket")]
    UnixNotSocket {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// A stale socket could not be removed.
    #[cfg(unix)]
    #[error("failed to remove stale unix socket {path}: {source}")]
    UnixCleanup {
        /// Socket path.
        path: Utf8PathBuf,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// Unix sockets are unavailable on this platform.
    #[cfg(not(unix))]
    #[error("unix sockets are unsupported on this platform")]
    UnsupportedUnix,
    /// The listener could not be switched to non-blocking mode.
    #[error("failed to enable non-blocking listener: {source}")]
    NonBlocking {
        /// OS error.
        #[source]
        source: io::Error,
    },
}

/// Where and how a plugin should listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    network: NetworkKind,
    host: String,
    port_range: Option<(u16, u16)>,
    unix_dir: Option<Utf8PathBuf>,
}

impl ListenerOptions {
    /// Listen on an ephemeral loopback TCP port.
    #[must_use]
    pub fn tcp() -> Self {
        Self {
            network: NetworkKind::Tcp,
            host: "127.0.0.1".to_owned(),
            port_range: None,
            unix_dir: None,
        }
    }

    /// Listen on a fresh Unix socket in the system temporary directory.
    #[must_use]
    pub fn unix() -> Self {
        Self {
            network: NetworkKind::Unix,
            ..Self::tcp()
        }
    }

    /// Applies the port range and socket directory the host injected into
    /// the environment.
    #[must_use]
    pub fn with_host_environment(mut self) -> Self {
        let port = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.trim().parse::<u16>().ok())
        };
        if let (Some(min), Some(max)) = (port(env::MIN_PORT), port(env::MAX_PORT)) {
            self.port_range = Some((min, max));
        }
        if let Some(dir) = std::env::var(env::UNIX_SOCKET_DIR)
            .ok()
            .filter(|dir| !dir.is_empty())
        {
            self.unix_dir = Some(Utf8PathBuf::from(dir));
        }
        self
    }

    /// Restricts TCP binding to an inclusive port range.
    #[must_use]
    pub const fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = Some((min, max));
        self
    }

    /// Sets the directory for Unix sockets.
    #[must_use]
    pub fn with_unix_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.unix_dir = Some(dir.into());
        self
    }

    /// Transport that will be used.
    #[must_use]
    pub const fn network(&self) -> NetworkKind {
        self.network
    }
}

#[derive(Debug)]
enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Bound, non-blocking plugin listener.
///
/// A Unix socket file is removed when the listener is dropped.
#[derive(Debug)]
pub struct PluginListener {
    endpoint: SocketEndpoint,
    listener: ListenerKind,
}

impl PluginListener {
    /// Binds according to `options`.
    ///
    /// # Errors
    ///
    /// Returns a [`ListenerError`] when no address could be bound.
    pub fn bind(options: &ListenerOptions) -> Result<Self, ListenerError> {
        let bound = match options.network {
            NetworkKind::Tcp => bind_tcp(&options.host, options.port_range)?,
            NetworkKind::Unix => bind_unix_in(options.unix_dir.as_deref())?,
        };
        set_nonblocking(&bound.listener)?;
        debug!(target: TRANSPORT_TARGET, endpoint = %bound.endpoint, "plugin listener bound");
        Ok(bound)
    }

    /// Endpoint clients should dial.
    #[must_use]
    pub const fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Accepts one pending connection, returning `None` when none is waiting.
    pub(crate) fn accept(&self) -> io::Result<Option<Connection>> {
        match &self.listener {
            ListenerKind::Tcp(tcp) => match tcp.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    Ok(Some(Connection::Tcp(stream)))
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(error) => Err(error),
            },
            #[cfg(unix)]
            ListenerKind::Unix(unix) => match unix.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    Ok(Some(Connection::Unix(stream)))
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(error) => Err(error),
            },
        }
    }
}

impl Drop for PluginListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        cleanup_unix_socket(&self.endpoint);
    }
}

fn set_nonblocking(listener: &ListenerKind) -> Result<(), ListenerError> {
    match listener {
        ListenerKind::Tcp(tcp) => tcp.set_nonblocking(true),
        #[cfg(unix)]
        ListenerKind::Unix(unix) => unix.set_nonblocking(true),
    }
    .map_err(|source| ListenerError::NonBlocking { source })
}

fn bind_tcp(host: &str, range: Option<(u16, u16)>) -> Result<PluginListener, ListenerError> {
    let (min, max) = range.unwrap_or((0, 0));
    if min > max {
        return Err(ListenerError::InvalidPortRange { min, max });
    }
    for port in min..=max {
        let addr = resolve(host, port)?;
        match TcpListener::bind(addr) {
            Ok(listener) => {
                let local = listener
                    .local_addr()
                    .map_err(|source| ListenerError::BindTcp { addr, source })?;
                return Ok(PluginListener {
                    endpoint: SocketEndpoint::tcp(local.ip().to_string(), local.port()),
                    listener: ListenerKind::Tcp(listener),
                });
            }
            Err(error) if error.kind() == io::ErrorKind::AddrInUse => {
                debug!(target: TRANSPORT_TARGET, port, "port taken, trying next");
            }
            Err(source) => return Err(ListenerError::BindTcp { addr, source }),
        }
    }
    Err(ListenerError::NoPortAvailable { min, max })
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ListenerError> {
    let resolve_error = |source: io::Error| ListenerError::Resolve {
        host: host.to_owned(),
        port,
        source,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(&resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

#[cfg(unix)]
fn socket_dir(dir: Option<&Utf8Path>) -> Result<Utf8PathBuf, ListenerError> {
    if let Some(dir) = dir {
        return Ok(dir.to_owned());
    }
    let temp = std::env::temp_dir();
    Utf8PathBuf::from_path_buf(temp).map_err(|path| ListenerError::NonUtf8Path {
        path: path.display().to_string(),
    })
}

#[cfg(unix)]
fn bind_unix_in(dir: Option<&Utf8Path>) -> Result<PluginListener, ListenerError> {
    let sequence = SOCKET_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = socket_dir(dir)?.join(format!(
        "tether-plugin-{}-{sequence}.sock",
        std::process::id()
    ));
    let listener = bind_unix(&path)?;
    Ok(PluginListener {
        endpoint: SocketEndpoint::unix(path),
        listener: ListenerKind::Unix(listener),
    })
}

#[cfg(not(unix))]
fn bind_unix_in(_dir: Option<&Utf8Path>) -> Result<PluginListener, ListenerError> {
    Err(ListenerError::UnsupportedUnix)
}

#[cfg(unix)]
fn bind_unix(path: &Utf8Path) -> Result<UnixListener, ListenerError> {
    if path.exists() {
        let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::UnixCleanup {
            path: path.to_owned(),
            source,
        })?;
        if !metadata.file_type().is_socket() {
            return Err(ListenerError::UnixNotSocket {
                path: path.to_owned(),
            });
        }
        match UnixStream::connect(path) {
            Ok(_stream) => {
                return Err(ListenerError::UnixInUse {
                    path: path.to_owned(),
                });
            }
            Err(_) => {
                fs::remove_file(path).map_err(|source| ListenerError::UnixCleanup {
                    path: path.to_owned(),
                    source,
                })?;
            }
        }
    }
    UnixListener::bind(path).map_err(|source| ListenerError::BindUnix {
        path: path.to_owned(),
        source,
    })
}

#[cfg(unix)]
fn cleanup_unix_socket(endpoint: &SocketEndpoint) {
    let Some(path) = endpoint.unix_path() else {
        return;
    };
    if let Err(error) = fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: TRANSPORT_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}
