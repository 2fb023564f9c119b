//! Plugin-side RPC server.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    CONTROL_SERVICE, PING_METHOD, QUIT_METHOD, RPC_TARGET, RpcError, RpcFault, RpcRequest,
    RpcResponse, read_frame, write_frame,
};
use crate::signal::ExitSignal;
use crate::transport::{Connection, PluginListener};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Handles calls addressed to one service name.
pub trait Service: Send + Sync {
    /// Handles `method` with the decoded parameters.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcFault`] that is sent back to the caller.
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcFault>;
}

struct ControlService;

impl Service for ControlService {
    fn call(&self, method: &str, _params: Value) -> Result<Value, RpcFault> {
        match method {
            PING_METHOD => Ok(Value::String("pong".to_owned())),
            // The connection fires shutdown once the reply is flushed.
            QUIT_METHOD => Ok(Value::Null),
            other => Err(RpcFault::unknown_method(CONTROL_SERVICE, other)),
        }
    }
}

/// Registry of services served to the host.
#[derive(Clone, Default)]
pub struct RpcServer {
    services: BTreeMap<String, Arc<dyn Service>>,
}

impl RpcServer {
    /// Creates a server with no application services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`. The control service name is
    /// reserved and cannot be replaced.
    #[must_use]
    pub fn register(mut self, name: impl Into<String>, service: impl Service + 'static) -> Self {
        let key: String = name.into();
        if key == CONTROL_SERVICE {
            warn!(target: RPC_TARGET, "ignoring attempt to replace the control service");
            return self;
        }
        self.services.insert(key, Arc::new(service));
        self
    }

    /// Names of registered application services.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Accepts connections until `shutdown` fires, serving each connection
    /// on its own thread. A `quit` control call fires `shutdown`.
    pub fn serve(&self, listener: &PluginListener, shutdown: &ExitSignal) {
        let mut services = self.services.clone();
        services.insert(CONTROL_SERVICE.to_owned(), Arc::new(ControlService));
        let services = Arc::new(services);
        info!(
            target: RPC_TARGET,
            endpoint = %listener.endpoint(),
            "plugin rpc server active"
        );

        let mut last_error = None::<io::ErrorKind>;
        while !shutdown.is_fired() {
            match listener.accept() {
                Ok(Some(connection)) => {
                    last_error = None;
                    let services = Arc::clone(&services);
                    let stop = shutdown.clone();
                    let spawned = thread::Builder::new()
                        .name("tether-rpc-conn".to_owned())
                        .spawn(move || serve_connection(connection, &services, &stop));
                    if let Err(error) = spawned {
                        warn!(target: RPC_TARGET, %error, "failed to start connection thread");
                    }
                }
                Ok(None) => {
                    let _stopped = shutdown.wait_timeout(ACCEPT_BACKOFF);
                }
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(target: RPC_TARGET, %error, "socket accept error");
                    }
                    last_error = Some(kind);
                    let _stopped = shutdown.wait_timeout(ERROR_BACKOFF);
                }
            }
        }
        info!(target: RPC_TARGET, "plugin rpc server stopped");
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn serve_connection(
    connection: Connection,
    services: &BTreeMap<String, Arc<dyn Service>>,
    shutdown: &ExitSignal,
) {
    let mut stream = BufReader::new(connection);
    loop {
        let request: RpcRequest = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(RpcError::Codec(error)) => {
                let fault = RpcFault::new(RpcFault::MALFORMED_REQUEST, error.to_string());
                if write_frame(stream.get_mut(), &RpcResponse::failure(0, fault)).is_err() {
                    break;
                }
                continue;
            }
            Err(error) => {
                debug!(target: RPC_TARGET, %error, "connection read failed");
                break;
            }
        };
        let quitting = request.service() == CONTROL_SERVICE && request.method() == QUIT_METHOD;
        let response = dispatch(services, request);
        if let Err(error) = write_frame(stream.get_mut(), &response) {
            debug!(target: RPC_TARGET, %error, "connection write failed");
            break;
        }
        if quitting {
            info!(target: RPC_TARGET, "host requested shutdown");
            shutdown.fire();
            break;
        }
    }
    debug!(target: RPC_TARGET, "connection closed");
}

fn dispatch(services: &BTreeMap<String, Arc<dyn Service>>, request: RpcRequest) -> RpcResponse {
    let id = request.id();
    let Some(service) = services.get(request.service()) else {
        let fault = RpcFault::new(
            RpcFault::UNKNOWN_SERVICE,
            format!("unknown service '{}'", request.service()),
        );
        return RpcResponse::failure(id, fault);
    };
    let method = request.method().to_owned();
    match service.call(&method, request.into_params()) {
        Ok(result) => RpcResponse::success(id, result),
        Err(fault) => RpcResponse::failure(id, fault),
    }
}
