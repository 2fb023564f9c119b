//! Shared fixtures for unit and behaviour tests.
//!
//! Tests stand in for a plugin with a shell script that prints a handshake
//! line pointing at an RPC server running inside the test process, then
//! sleeps. The script gives the supervisor a real child to manage while
//! keeping the RPC side observable.

use std::any::Any;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use tether_config::{SocketEndpoint, Timeouts};

use crate::client::{ClientConfig, PluginCommand};
use crate::handshake::HandshakeConfig;
use crate::rpc::{Plugin, PluginSet, RpcCaller, RpcError, RpcFault, RpcServer, Service};
use crate::signal::ExitSignal;
use crate::supervisor::OutputSink;
use crate::transport::{ListenerOptions, PluginListener};

pub(crate) const COOKIE_KEY: &str = "TETHER_TEST_COOKIE";
pub(crate) const COOKIE_VALUE: &str = "b1e6";

/// Service doubling integers.
pub(crate) struct DoublerService;

impl Service for DoublerService {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        if method != "double" {
            return Err(RpcFault::unknown_method("test", method));
        }
        let value: i64 = serde_json::from_value(params).map_err(|e| RpcFault::invalid_params(&e))?;
        Ok(Value::from(value.saturating_mul(2)))
    }
}

/// Host-side stub for [`DoublerService`].
#[derive(Debug)]
pub(crate) struct Doubler {
    caller: RpcCaller,
}

impl Doubler {
    pub(crate) fn double(&self, value: i64) -> Result<i64, RpcError> {
        self.caller.call_as("double", &value)
    }
}

pub(crate) struct DoublerPlugin;

impl Plugin for DoublerPlugin {
    fn client(&self, caller: RpcCaller) -> Box<dyn Any + Send> {
        Box::new(Doubler { caller })
    }
}

pub(crate) fn doubler_set() -> PluginSet {
    PluginSet::new().with("test", DoublerPlugin)
}

/// RPC server running on a thread of the test process.
pub(crate) struct InProcessServer {
    endpoint: SocketEndpoint,
    shutdown: ExitSignal,
    thread: Option<JoinHandle<()>>,
}

impl InProcessServer {
    pub(crate) fn start() -> Self {
        let listener = PluginListener::bind(&ListenerOptions::tcp()).expect("bind listener");
        let endpoint = listener.endpoint().clone();
        let shutdown = ExitSignal::new();
        let stop = shutdown.clone();
        let thread = thread::spawn(move || {
            RpcServer::new()
                .register("test", DoublerService)
                .serve(&listener, &stop);
        });
        Self {
            endpoint,
            shutdown,
            thread: Some(thread),
        }
    }

    pub(crate) const fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    /// Handshake line announcing this server.
    pub(crate) fn handshake(&self, app_version: u32) -> String {
        format!("1|{app_version}|tcp|{}|rpc", self.endpoint.wire_address())
    }

    /// Shell plugin printing `line`, running `after`, then sleeping.
    pub(crate) fn plugin(line: &str, after: &str) -> PluginCommand {
        PluginCommand::new("sh")
            .arg("-c")
            .arg(format!("echo '{line}'; {after} exec sleep 30"))
    }

    /// Client configuration for a well-behaved shell plugin.
    pub(crate) fn config(&self) -> ClientConfig {
        ClientConfig::for_command(Self::plugin(&self.handshake(1), ""))
            .with_handshake(HandshakeConfig::new(1, COOKIE_KEY, COOKIE_VALUE))
            .with_plugins(doubler_set())
            .with_timeouts(quick_timeouts())
    }
}

impl Drop for InProcessServer {
    fn drop(&mut self) {
        self.shutdown.fire();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("server thread");
        }
    }
}

pub(crate) fn quick_timeouts() -> Timeouts {
    Timeouts::default()
        .with_startup(Duration::from_secs(5))
        .with_dial_window(Duration::from_secs(2))
        .with_kill_grace(Duration::from_millis(200))
}

/// In-memory output sink.
pub(crate) fn capture() -> (Arc<Mutex<Vec<u8>>>, OutputSink) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<Mutex<dyn Write + Send>> = buffer.clone();
    (buffer, sink)
}

pub(crate) fn captured(buffer: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&buffer.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
}

/// Polls `condition` until it holds or `timeout` passes.
pub(crate) fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
