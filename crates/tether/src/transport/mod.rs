//! Byte streams between host and plugin.
//!
//! [`Connection`] is produced on the host side by the negotiator and on the
//! plugin side by [`PluginListener`]; the RPC layer reads and writes JSONL
//! frames over it without caring which transport carries them.

mod listener;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tracing::debug;

pub use self::listener::{ListenerError, ListenerOptions, PluginListener};

/// Log target for transport events.
pub(crate) const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");

/// Stream produced by a TLS upgrade or another stream wrapper.
pub trait SecureStream: Read + Write + Send + Sync {
    /// Sets the read timeout on the underlying socket.
    ///
    /// # Errors
    ///
    /// Returns the socket error, if any.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shuts down both halves of the stream.
    ///
    /// # Errors
    ///
    /// Returns the socket error, if any.
    fn shutdown(&self) -> io::Result<()>;
}

/// Established stream to a plugin endpoint.
pub enum Connection {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// Plain Unix domain stream.
    #[cfg(unix)]
    Unix(UnixStream),
    /// Stream wrapped by a [`SecureStream`] implementation.
    Secured(Box<dyn SecureStream>),
}

impl Connection {
    /// Sets the read timeout on the underlying socket.
    ///
    /// # Errors
    ///
    /// Returns the socket error, if any.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_read_timeout(timeout),
            Self::Secured(stream) => stream.set_read_timeout(timeout),
        }
    }

    /// Shuts down both halves of the stream. A peer that already closed is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns the socket error, if any.
    pub fn shutdown(&self) -> io::Result<()> {
        let outcome = match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
            Self::Secured(stream) => stream.shutdown(),
        };
        match outcome {
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Second handle on the same socket, able to shut it down while another
    /// thread is blocked reading. Wrapped streams have none.
    pub(crate) fn shutdown_handle(&self) -> Option<Self> {
        let cloned = match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
            Self::Secured(_) => return None,
        };
        cloned
            .inspect_err(|error| {
                debug!(target: TRANSPORT_TARGET, %error, "could not clone socket for shutdown");
            })
            .ok()
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            #[cfg(unix)]
            Self::Unix(_) => "unix",
            Self::Secured(_) => "secured",
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.kind()).finish()
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
            Self::Secured(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
            Self::Secured(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
            Self::Secured(stream) => stream.flush(),
        }
    }
}
