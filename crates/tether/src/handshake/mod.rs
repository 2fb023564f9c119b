//! Parsing of the single handshake line a plugin prints on startup.
//!
//! The line has the shape
//! `CORE-VERSION|APP-VERSION|NETWORK-TYPE|NETWORK-ADDR|PROTOCOL[|SERVER-CERT]`
//! and is terminated by a newline. The certificate field is optional and,
//! when present and non-empty, holds a standard base64 encoding.
//!
//! [`parse`] is pure: it either yields a fully validated [`HandshakeLine`] or
//! an error, and has no side effects on any controller state.

mod config;

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tether_config::{EndpointParseError, NetworkKind, SocketEndpoint};
use thiserror::Error;

pub use self::config::HandshakeConfig;

/// Core protocol version implemented by this crate.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Field separator used on the handshake line.
pub const DELIMITER: char = '|';

const REQUIRED_FIELDS: usize = 5;
const MAX_FIELDS: usize = 6;

/// Wire protocols a plugin may announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ProtocolKind {
    /// Newline-delimited JSON request/response RPC.
    #[serde(rename = "rpc")]
    NetRpc,
    /// gRPC. Recognised on the wire; no transport ships with this crate.
    #[serde(rename = "grpc")]
    Grpc,
}

impl ProtocolKind {
    /// Wire name of the protocol.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetRpc => "rpc",
            Self::Grpc => "grpc",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rpc" => Ok(Self::NetRpc),
            "grpc" => Ok(Self::Grpc),
            other => Err(HandshakeError::UnknownProtocol {
                protocol: other.to_owned(),
            }),
        }
    }
}

/// Validated contents of a handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    core_version: u32,
    app_version: u32,
    endpoint: SocketEndpoint,
    protocol: ProtocolKind,
    server_certificate: Option<Vec<u8>>,
}

impl HandshakeLine {
    /// Builds a handshake line without a server certificate.
    #[must_use]
    pub const fn new(
        core_version: u32,
        app_version: u32,
        endpoint: SocketEndpoint,
        protocol: ProtocolKind,
    ) -> Self {
        Self {
            core_version,
            app_version,
            endpoint,
            protocol,
            server_certificate: None,
        }
    }

    /// Attaches a DER-encoded server certificate.
    #[must_use]
    pub fn with_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.server_certificate = Some(certificate);
        self
    }

    /// Core protocol version claimed by the plugin.
    #[must_use]
    pub const fn core_version(&self) -> u32 {
        self.core_version
    }

    /// Application protocol version claimed by the plugin.
    #[must_use]
    pub const fn app_version(&self) -> u32 {
        self.app_version
    }

    /// Endpoint the plugin listens on.
    #[must_use]
    pub const fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Wire protocol the plugin speaks.
    #[must_use]
    pub const fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Decoded server certificate, if one was announced.
    #[must_use]
    pub fn server_certificate(&self) -> Option<&[u8]> {
        self.server_certificate.as_deref()
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{core}{DELIMITER}{app}{DELIMITER}{network}{DELIMITER}{address}{DELIMITER}{protocol}",
            core = self.core_version,
            app = self.app_version,
            network = self.endpoint.network(),
            address = self.endpoint.wire_address(),
            protocol = self.protocol,
        )?;
        if let Some(certificate) = &self.server_certificate {
            write!(f, "{DELIMITER}{}", STANDARD.encode(certificate))?;
        }
        Ok(())
    }
}

/// Errors raised while obtaining or validating a plugin's handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The line does not have the expected shape.
    #[error("malformed handshake line '{line}': {reason}")]
    Format {
        /// The offending line, trimmed of its terminator.
        line: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The plugin claims a core version the host does not implement.
    #[error(
        "plugin speaks core protocol version {claimed}, host supports {supported:?}; \
         rebuild the plugin against a compatible host library"
    )]
    UnsupportedCoreVersion {
        /// Versions the host accepts.
        supported: Vec<u32>,
        /// Version announced by the plugin.
        claimed: u32,
    },
    /// The plugin claims an application version with no plugin set.
    #[error(
        "plugin speaks application protocol version {claimed}, host supports {supported:?}"
    )]
    UnsupportedAppVersion {
        /// Versions for which the host has plugin sets.
        supported: Vec<u32>,
        /// Version announced by the plugin.
        claimed: u32,
    },
    /// The network type field is not a known transport.
    #[error("unknown network type '{network}' in handshake")]
    UnknownNetwork {
        /// The unrecognised value.
        network: String,
    },
    /// The address could not be parsed for the announced transport.
    #[error("invalid address '{address}' in handshake: {source}")]
    InvalidAddress {
        /// The unparseable address.
        address: String,
        /// Underlying parse failure.
        #[source]
        source: EndpointParseError,
    },
    /// The protocol field is not a known protocol.
    #[error("unknown protocol '{protocol}' in handshake")]
    UnknownProtocol {
        /// The unrecognised value.
        protocol: String,
    },
    /// The announced protocol is not in the host's allow-list.
    #[error("plugin protocol '{protocol}' is not allowed; host accepts {allowed:?}")]
    ProtocolNotAllowed {
        /// Protocol announced by the plugin.
        protocol: ProtocolKind,
        /// Protocols the host accepts.
        allowed: Vec<ProtocolKind>,
    },
    /// The certificate field is not valid base64.
    #[error("invalid server certificate in handshake: {0}")]
    InvalidCertificate(#[from] base64::DecodeError),
    /// The plugin exited before printing a handshake line.
    #[error("plugin exited before completing the handshake (exit code {code:?})")]
    ExitedBeforeHandshake {
        /// Exit code, if the process exited normally and it is known.
        code: Option<i32>,
    },
    /// No handshake line arrived within the startup timeout.
    #[error("timed out after {waited_ms}ms waiting for the plugin handshake")]
    Timeout {
        /// Milliseconds waited.
        waited_ms: u64,
    },
}

impl HandshakeError {
    /// Whether the error describes a malformed line rather than a version or
    /// lifecycle problem.
    #[must_use]
    pub const fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::Format { .. }
                | Self::UnknownNetwork { .. }
                | Self::InvalidAddress { .. }
                | Self::UnknownProtocol { .. }
                | Self::InvalidCertificate(_)
        )
    }

    /// Whether the error is a version or protocol incompatibility.
    #[must_use]
    pub const fn is_incompatible(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedCoreVersion { .. }
                | Self::UnsupportedAppVersion { .. }
                | Self::ProtocolNotAllowed { .. }
        )
    }
}

fn format_error(line: &str, reason: impl Into<String>) -> HandshakeError {
    HandshakeError::Format {
        line: line.to_owned(),
        reason: reason.into(),
    }
}

fn parse_version(line: &str, label: &str, raw: &str) -> Result<u32, HandshakeError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| format_error(line, format!("{label} version '{raw}' is not an integer")))
}

/// Parses and validates one handshake line.
///
/// A trailing `\n` or `\r\n` is ignored. The core version is checked against
/// `supported_core` before any further field is interpreted.
///
/// # Errors
///
/// Returns a [`HandshakeError`] when the field count is not five or six, a
/// version is not an integer, the core version is not in `supported_core`,
/// the network, address, or protocol is unknown, or the certificate is not
/// valid base64.
///
/// # Example
///
/// ```
/// use tether::handshake::{self, ProtocolKind};
///
/// let line = handshake::parse("1|3|tcp|127.0.0.1:4000|rpc\n", &[1]).expect("valid line");
/// assert_eq!(line.app_version(), 3);
/// assert_eq!(line.protocol(), ProtocolKind::NetRpc);
/// assert!(line.server_certificate().is_none());
/// ```
pub fn parse(raw: &str, supported_core: &[u32]) -> Result<HandshakeLine, HandshakeError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    let field_count = fields.len();
    let wrong_count = || {
        format_error(
            line,
            format!("expected {REQUIRED_FIELDS} or {MAX_FIELDS} fields, found {field_count}"),
        )
    };
    if field_count > MAX_FIELDS {
        return Err(wrong_count());
    }
    let [core, app, network, address, protocol, rest @ ..] = fields.as_slice() else {
        return Err(wrong_count());
    };

    let core_version = parse_version(line, "core protocol", core)?;
    if !supported_core.contains(&core_version) {
        return Err(HandshakeError::UnsupportedCoreVersion {
            supported: supported_core.to_vec(),
            claimed: core_version,
        });
    }
    let app_version = parse_version(line, "application protocol", app)?;

    let network_kind = network
        .parse::<NetworkKind>()
        .map_err(|_| HandshakeError::UnknownNetwork {
            network: (*network).to_owned(),
        })?;
    let endpoint = SocketEndpoint::from_wire(network_kind, address).map_err(|source| {
        HandshakeError::InvalidAddress {
            address: (*address).to_owned(),
            source,
        }
    })?;
    let protocol_kind = protocol.parse::<ProtocolKind>()?;

    let mut parsed = HandshakeLine::new(core_version, app_version, endpoint, protocol_kind);
    if let Some(encoded) = rest.first().filter(|encoded| !encoded.is_empty()) {
        parsed = parsed.with_certificate(STANDARD.decode(encoded)?);
    }
    Ok(parsed)
}
