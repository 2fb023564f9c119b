//! A minimal plugin used to exercise the tether host end to end.
//!
//! The binary picks a behaviour from its first argument. `serve` and
//! `serve-unix` run a well-behaved plugin exposing the `test` capability,
//! the former through [`tether::serve`] exactly as a production plugin would;
//! the remaining modes misbehave in the ways a host must survive: exiting
//! before the handshake, announcing an unsupported core version, printing
//! garbage, or never announcing at all.
//!
//! The library half holds the capability's service and host-side stub so
//! integration tests can dispense the same types the binary serves.

use std::any::Any;
use std::io::{self, Write};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tether::transport::ListenerOptions;
use tether::{
    ExitSignal, HandshakeConfig, Plugin, PluginSet, RpcCaller, RpcError, RpcFault, RpcServer,
    ServeConfig, ServeError, Service,
};
use thiserror::Error;
use tracing::info;

const PLUGIN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::plugin");

/// Environment variable carrying the magic cookie.
pub const COOKIE_KEY: &str = "TETHER_TEST_PLUGIN_COOKIE";
/// Expected cookie value.
pub const COOKIE_VALUE: &str = "c0ffee";
/// Name under which the capability is registered.
pub const CAPABILITY: &str = "test";
/// How long the misbehaving modes linger after printing.
const LINGER: Duration = Duration::from_secs(60);

/// Handshake settings shared by the plugin and its hosts.
#[must_use]
pub fn handshake_config() -> HandshakeConfig {
    HandshakeConfig::new(1, COOKIE_KEY, COOKIE_VALUE)
}

/// Service answering `double` and `pid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestService;

impl Service for TestService {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        match method {
            "double" => {
                let value: i64 =
                    serde_json::from_value(params).map_err(|e| RpcFault::invalid_params(&e))?;
                Ok(Value::from(value.saturating_mul(2)))
            }
            "pid" => Ok(Value::from(std::process::id())),
            other => Err(RpcFault::unknown_method(CAPABILITY, other)),
        }
    }
}

/// Host-side stub for [`TestService`].
#[derive(Debug)]
pub struct TestStub {
    caller: RpcCaller,
}

impl TestStub {
    /// Asks the plugin to double `value`.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when the call fails.
    pub fn double(&self, value: i64) -> Result<i64, RpcError> {
        self.caller.call_as("double", &value)
    }

    /// Process id of the serving plugin.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when the call fails.
    pub fn pid(&self) -> Result<u32, RpcError> {
        self.caller.call_as("pid", &())
    }
}

/// Host-side factory for [`TestStub`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TestPlugin;

impl Plugin for TestPlugin {
    fn client(&self, caller: RpcCaller) -> Box<dyn Any + Send> {
        Box::new(TestStub { caller })
    }
}

/// Plugin set a host registers to talk to this binary.
#[must_use]
pub fn plugin_set() -> PluginSet {
    PluginSet::new().with(CAPABILITY, TestPlugin)
}

/// Behaviour selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve over TCP.
    Serve,
    /// Serve over a Unix socket.
    ServeUnix,
    /// Exit with status 3 without printing anything.
    SilentExit,
    /// Announce core protocol version 99.
    BadCoreVersion,
    /// Print a line that is not a handshake.
    Garbage,
    /// Never print anything.
    Hang,
}

/// Unrecognised mode argument.
#[derive(Debug, Error)]
#[error("unknown mode '{0}'")]
pub struct UnknownMode(String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "serve" => Ok(Self::Serve),
            "serve-unix" => Ok(Self::ServeUnix),
            "silent-exit" => Ok(Self::SilentExit),
            "bad-core-version" => Ok(Self::BadCoreVersion),
            "garbage" => Ok(Self::Garbage),
            "hang" => Ok(Self::Hang),
            other => Err(UnknownMode(other.to_owned())),
        }
    }
}

/// Exit status reported by [`Mode::SilentExit`].
pub const SILENT_EXIT_CODE: u8 = 3;

/// Errors raised while running the plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The serve bootstrap failed.
    #[error(transparent)]
    Serve(#[from] ServeError),
    /// Writing to stdout failed.
    #[error("failed to write to stdout: {0}")]
    Stdout(#[from] io::Error),
}

/// Configuration the serving modes hand to the bootstrap.
#[must_use]
pub fn serve_config(unix: bool) -> ServeConfig {
    let listener = if unix {
        ListenerOptions::unix()
    } else {
        ListenerOptions::tcp()
    };
    let server = RpcServer::new().register(CAPABILITY, TestService);
    ServeConfig::new(handshake_config(), server.clone())
        .with_version(2, server)
        .with_listener(listener.with_host_environment())
}

/// Runs `mode`, writing anything meant for the host to `out`. Returns the
/// exit status the process should report.
///
/// [`Mode::Serve`] announces on the process stdout through
/// [`tether::serve`] and ignores `out`.
///
/// # Errors
///
/// Returns a [`PluginError`] when serving fails or `out` is closed.
pub fn run<W: Write>(mode: Mode, out: &mut W) -> Result<u8, PluginError> {
    match mode {
        Mode::Serve => {
            info!(target: PLUGIN_TARGET, transport = "tcp", "serving");
            tether::serve(&serve_config(false))?;
            info!(target: PLUGIN_TARGET, "host asked us to quit");
            Ok(0)
        }
        Mode::ServeUnix => {
            let announced =
                tether::announce(&serve_config(true), |key| std::env::var(key).ok(), out)?;
            info!(target: PLUGIN_TARGET, line = %announced.handshake(), "serving");
            announced.run(&ExitSignal::new());
            info!(target: PLUGIN_TARGET, "host asked us to quit");
            Ok(0)
        }
        Mode::SilentExit => Ok(SILENT_EXIT_CODE),
        Mode::BadCoreVersion => linger(out, "99|1|tcp|127.0.0.1:1|rpc"),
        Mode::Garbage => linger(out, "this plugin has nothing to say"),
        Mode::Hang => {
            thread::sleep(LINGER);
            Ok(0)
        }
    }
}

fn linger<W: Write>(out: &mut W, line: &str) -> Result<u8, PluginError> {
    writeln!(out, "{line}")?;
    out.flush()?;
    thread::sleep(LINGER);
    Ok(0)
}
