//! Socket endpoints announced by plugins.
//!
//! A plugin reports where it listens as a `(network, address)` pair inside its
//! handshake line. [`SocketEndpoint`] is the typed form of that pair and is
//! what reattach descriptors persist. The URL form (`unix:///run/p.sock`,
//! `tcp://127.0.0.1:4000`) is used by the operator CLI.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use url::Url;

/// Transport families a plugin may listen on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkKind {
    /// Unix domain stream socket.
    Unix,
    /// TCP stream socket.
    Tcp,
}

/// Declarative description of a plugin listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum SocketEndpoint {
    /// Unix domain socket endpoint.
    Unix {
        /// Filesystem path of the socket.
        path: Utf8PathBuf,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or IP literal, without brackets.
        host: String,
        /// Listening port.
        port: u16,
    },
}

impl SocketEndpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parses the `(network, address)` pair carried by a handshake line.
    ///
    /// TCP addresses use `host:port`; IPv6 hosts must be bracketed
    /// (`[::1]:4000`). Unix addresses are taken verbatim as a path.
    ///
    /// # Errors
    ///
    /// Returns an [`EndpointParseError`] when the address is empty, lacks a
    /// port, or carries a port outside the `u16` range.
    pub fn from_wire(network: NetworkKind, address: &str) -> Result<Self, EndpointParseError> {
        match network {
            NetworkKind::Unix => {
                if address.is_empty() {
                    return Err(EndpointParseError::MissingUnixPath(address.to_owned()));
                }
                Ok(Self::unix(address))
            }
            NetworkKind::Tcp => {
                let (raw_host, raw_port) = address
                    .rsplit_once(':')
                    .ok_or_else(|| EndpointParseError::MissingPort(address.to_owned()))?;
                let host = unbracket(raw_host);
                if host.is_empty() {
                    return Err(EndpointParseError::MissingHost(address.to_owned()));
                }
                let port = raw_port
                    .parse::<u16>()
                    .map_err(|_| EndpointParseError::InvalidPort(address.to_owned()))?;
                Ok(Self::tcp(host, port))
            }
        }
    }

    /// Returns the transport family of this endpoint.
    #[must_use]
    pub const fn network(&self) -> NetworkKind {
        match self {
            Self::Unix { .. } => NetworkKind::Unix,
            Self::Tcp { .. } => NetworkKind::Tcp,
        }
    }

    /// Renders the address half of the handshake pair.
    #[must_use]
    pub fn wire_address(&self) -> String {
        match self {
            Self::Unix { path } => path.to_string(),
            Self::Tcp { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }
}

fn unbracket(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { .. } => write!(formatter, "tcp://{}", self.wire_address()),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(EndpointParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| EndpointParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(unbracket(host), port))
            }
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Errors encountered while parsing a [`SocketEndpoint`].
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// URL scheme was not recognised.
    #[error("unsupported socket scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// TCP port was not a valid 16-bit integer.
    #[error("invalid TCP port in '{0}'")]
    InvalidPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("127.0.0.1:4000", "127.0.0.1", 4000)]
    #[case("localhost:1", "localhost", 1)]
    #[case("[::1]:9000", "::1", 9000)]
    fn parses_tcp_wire_addresses(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let endpoint =
            SocketEndpoint::from_wire(NetworkKind::Tcp, input).expect("tcp address parses");
        assert_eq!(endpoint, SocketEndpoint::tcp(host, port));
        assert_eq!(endpoint.wire_address(), input);
    }

    #[rstest]
    #[case("127.0.0.1")]
    #[case(":4000")]
    #[case("127.0.0.1:99999")]
    #[case("127.0.0.1:port")]
    fn rejects_malformed_tcp_wire_addresses(#[case] input: &str) {
        let result = SocketEndpoint::from_wire(NetworkKind::Tcp, input);
        assert!(result.is_err(), "expected '{input}' to be rejected");
    }

    #[test]
    fn unix_wire_address_is_verbatim() {
        let endpoint = SocketEndpoint::from_wire(NetworkKind::Unix, "/tmp/plugin.sock")
            .expect("unix address parses");
        assert_eq!(endpoint.network(), NetworkKind::Unix);
        assert_eq!(
            endpoint.unix_path().map(Utf8Path::as_str),
            Some("/tmp/plugin.sock")
        );
    }

    #[test]
    fn empty_unix_wire_address_is_rejected() {
        let error = SocketEndpoint::from_wire(NetworkKind::Unix, "")
            .expect_err("empty path should fail");
        assert!(matches!(error, EndpointParseError::MissingUnixPath(_)));
    }

    #[test]
    fn display_and_parse_agree_for_tcp() {
        let endpoint = SocketEndpoint::tcp("127.0.0.1", 4000);
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:4000");
        let parsed: SocketEndpoint = endpoint.to_string().parse().expect("url form parses");
        assert_eq!(parsed, endpoint);
    }

    #[test]
    fn display_unix_socket() {
        let endpoint = SocketEndpoint::unix("/tmp/tether.sock");
        assert_eq!(endpoint.to_string(), "unix:///tmp/tether.sock");
    }

    #[test]
    fn rejects_unknown_scheme() {
        let error = "http://127.0.0.1:80"
            .parse::<SocketEndpoint>()
            .expect_err("http is not a socket scheme");
        assert!(matches!(error, EndpointParseError::UnsupportedScheme(ref s) if s == "http"));
    }

    #[rstest]
    #[case("unix", NetworkKind::Unix)]
    #[case("tcp", NetworkKind::Tcp)]
    fn network_kind_parses_wire_names(#[case] input: &str, #[case] expected: NetworkKind) {
        assert_eq!(input.parse::<NetworkKind>().ok(), Some(expected));
        assert_eq!(expected.to_string(), input);
    }

    #[test]
    fn serialises_with_transport_tag() {
        let endpoint = SocketEndpoint::tcp("127.0.0.1", 4000);
        let json = serde_json::to_value(&endpoint).expect("serialise endpoint");
        assert_eq!(
            json,
            serde_json::json!({"transport": "tcp", "host": "127.0.0.1", "port": 4000})
        );
    }
}
