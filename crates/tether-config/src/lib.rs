//! Shared value types for the tether plugin host.
//!
//! The controller, the operator CLI, and plugin binaries all need to agree on
//! how a plugin's listening address is described, which environment variables
//! carry the negotiation contract, and which timing policy governs startup,
//! dialing, and teardown. Those types live here so no crate has to depend on
//! the controller just to read a persisted reattach descriptor.

mod endpoint;
pub mod env;
mod logging;
mod timeouts;

pub use self::endpoint::{EndpointParseError, NetworkKind, SocketEndpoint};
pub use self::logging::{LogFormat, LogFormatParseError};
pub use self::timeouts::Timeouts;
