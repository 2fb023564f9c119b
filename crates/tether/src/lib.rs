//! Host-side lifecycle control for out-of-process plugins.
//!
//! A host describes how to launch a plugin binary in a [`ClientConfig`] and
//! hands it to a [`Client`]. Starting the client spawns the plugin, reads the
//! single handshake line the plugin prints on standard output, validates the
//! negotiated protocol versions, and dials the endpoint the plugin announced.
//! The resulting [`RpcClient`] dispenses typed stubs for the capabilities the
//! host registered in a [`PluginSet`].
//!
//! A running plugin can outlive its host. [`Client::reattach_config`] yields
//! a serialisable [`ReattachConfig`] that a later host passes to
//! [`ClientConfig::for_reattach`] to adopt the same process instead of
//! spawning a new one.
//!
//! Plugin binaries use [`serve()`] to perform their side of the contract.
//!
//! # Example
//!
//! ```rust,no_run
//! use tether::{Client, ClientConfig, Context, PluginCommand, PluginSet};
//!
//! let config = ClientConfig::for_command(PluginCommand::new("/usr/libexec/tether-echo"))
//!     .with_plugins(PluginSet::new());
//! let client = Client::new(config);
//! let rpc = client.start(&Context::background()).expect("plugin starts");
//! rpc.ping().expect("plugin answers");
//! client.kill(&Context::background());
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod handshake;
pub mod negotiator;
pub mod reattach;
pub mod registry;
pub mod rpc;
pub mod serve;
pub mod session;
pub mod signal;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

pub use self::client::{Client, ClientConfig, ClientState, PluginCommand};
pub use self::context::{CancelHandle, Context, ContextError};
pub use self::error::{ClientError, ClientErrorKind, ConfigError, MisuseError};
pub use self::handshake::{HandshakeConfig, HandshakeError, HandshakeLine, ProtocolKind};
pub use self::negotiator::{ConnectError, DialPolicy, TlsUpgrade};
pub use self::reattach::{LivenessTest, ReattachConfig};
pub use self::registry::ClientRegistry;
pub use self::rpc::{Plugin, PluginSet, RpcCaller, RpcClient, RpcError, RpcFault, RpcServer, Service};
pub use self::serve::{Announced, ServeConfig, ServeError, announce, serve};
pub use self::session::{Detacher, NoDetach, SessionDetacher, platform_detacher};
pub use self::signal::ExitSignal;
pub use self::supervisor::{LivenessProbe, OutputSink, ProbeError, SignalProbe, SpawnError};
pub use tether_config::{SocketEndpoint, Timeouts};
