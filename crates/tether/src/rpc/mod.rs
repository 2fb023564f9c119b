//! Newline-delimited JSON RPC spoken over a plugin [`Connection`].
//!
//! Each request is one JSON object on its own line naming a service, a
//! method, and parameters; the peer answers with one line carrying either a
//! result or an error. Requests on one connection are strictly sequential.
//!
//! Every server exposes a built-in `control` service with `ping` and `quit`
//! methods, used by the host for liveness checks and graceful shutdown.
//!
//! [`Connection`]: crate::transport::Connection

mod client;
mod message;
mod plugin;
mod server;

use std::io;

use thiserror::Error;

pub use self::client::RpcClient;
pub use self::message::{RpcFault, RpcRequest, RpcResponse};
pub(crate) use self::message::{read_frame, write_frame};
pub use self::plugin::{Plugin, PluginSet, RpcCaller};
pub use self::server::{RpcServer, Service};

/// Log target for RPC traffic.
pub(crate) const RPC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::rpc");

/// Name of the built-in service every server exposes.
pub const CONTROL_SERVICE: &str = "control";
/// Control method answering liveness checks.
pub const PING_METHOD: &str = "ping";
/// Control method asking the plugin to shut down.
pub const QUIT_METHOD: &str = "quit";

/// Errors raised by RPC calls.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The transport failed mid-call.
    #[error("rpc transport failed: {0}")]
    Io(#[from] io::Error),
    /// A frame could not be encoded or decoded.
    #[error("malformed rpc frame: {0}")]
    Codec(#[from] serde_json::Error),
    /// A frame exceeded the size limit.
    #[error("rpc frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// Maximum frame size in bytes.
        limit: usize,
    },
    /// The connection is closed.
    #[error("rpc connection is closed")]
    Closed,
    /// Another call holds the connection.
    #[error("another rpc call is in flight")]
    Busy,
    /// The response id did not match the request.
    #[error("rpc response id {received} does not match request {expected}")]
    MismatchedResponse {
        /// Id of the request sent.
        expected: u64,
        /// Id carried by the response.
        received: u64,
    },
    /// The remote side reported an error.
    #[error("plugin returned an error: {0}")]
    Remote(#[from] RpcFault),
    /// No plugin of that name is in the negotiated set.
    #[error("unknown plugin '{name}'; available: {available:?}")]
    UnknownPlugin {
        /// Requested name.
        name: String,
        /// Names in the negotiated set.
        available: Vec<String>,
    },
    /// The dispensed stub is not of the requested type.
    #[error("plugin '{name}' does not dispense a {expected}")]
    StubType {
        /// Requested name.
        name: String,
        /// Requested Rust type.
        expected: &'static str,
    },
}

#[cfg(test)]
mod tests;
