//! Host-side RPC client over an established plugin connection.

use std::any::{Any, type_name};
use std::fmt;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use super::{
    CONTROL_SERVICE, PING_METHOD, PluginSet, QUIT_METHOD, RPC_TARGET, RpcCaller, RpcError,
    RpcRequest, RpcResponse, read_frame, write_frame,
};
use crate::transport::Connection;

type Stream = Option<BufReader<Connection>>;

/// RPC client for one plugin connection.
///
/// Calls are serialised: concurrent callers take turns on the connection.
/// After [`RpcClient::close`] or a transport failure every call returns
/// [`RpcError::Closed`]. Closing never waits for a call in flight; it shuts
/// the socket down underneath it instead.
pub struct RpcClient {
    stream: Mutex<Stream>,
    closer: Option<Connection>,
    closed: AtomicBool,
    next_id: AtomicU64,
    plugins: PluginSet,
}

impl RpcClient {
    /// Wraps a connection; `plugins` is the set [`RpcClient::dispense`] serves.
    #[must_use]
    pub fn new(connection: Connection, plugins: PluginSet) -> Arc<Self> {
        Arc::new(Self {
            closer: connection.shutdown_handle(),
            stream: Mutex::new(Some(BufReader::new(connection))),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            plugins,
        })
    }

    /// Calls `service.method` with raw JSON parameters.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] after close, [`RpcError::Remote`] when the
    /// plugin reports an error, and transport or codec errors otherwise. A
    /// transport or codec failure closes the client.
    pub fn call(&self, service: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let mut guard = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        self.call_locked(&mut guard, service, method, params)
    }

    fn call_locked(
        &self,
        guard: &mut MutexGuard<'_, Stream>,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, service, method, params);
        let outcome = match guard.as_mut() {
            Some(stream) if !self.is_closed() => {
                trace!(target: RPC_TARGET, id, service, method, "sending rpc request");
                exchange(stream, &request)
            }
            _ => Err(RpcError::Closed),
        };
        if let Err(error) = &outcome
            && !self.closed.swap(true, Ordering::AcqRel)
        {
            debug!(target: RPC_TARGET, id, service, method, %error, "rpc exchange failed; closing");
        }
        if self.is_closed() {
            release(guard.take());
        }
        Ok(outcome?.into_result()?)
    }

    /// Takes the connection without waiting for a call in flight.
    fn try_stream(&self) -> Result<MutexGuard<'_, Stream>, RpcError> {
        match self.stream.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(RpcError::Busy),
        }
    }

    /// Calls `service.method`, serialising `params` and decoding the result.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::call`], plus codec errors for the parameters and the
    /// result.
    pub fn call_as<P, R>(&self, service: &str, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = serde_json::to_value(params)?;
        let result = self.call(service, method, value)?;
        Ok(serde_json::from_value(result)?)
    }

    /// Round-trips a control ping.
    ///
    /// # Errors
    ///
    /// Returns an [`RpcError`] when the plugin does not answer.
    pub fn ping(&self) -> Result<(), RpcError> {
        self.call(CONTROL_SERVICE, PING_METHOD, Value::Null)
            .map(drop)
    }

    /// Pings without queueing behind another call, waiting at most `timeout`
    /// for the answer.
    ///
    /// Returns [`RpcError::Busy`] while another call holds the connection.
    pub(crate) fn ping_within(&self, timeout: Duration) -> Result<(), RpcError> {
        let mut guard = self.try_stream()?;
        set_read_timeout(&guard, Some(timeout))?;
        let answered = self.call_locked(&mut guard, CONTROL_SERVICE, PING_METHOD, Value::Null);
        if answered.is_ok() {
            set_read_timeout(&guard, None)?;
        }
        answered.map(drop)
    }

    /// Asks the plugin to shut down, waiting at most `timeout` for the
    /// acknowledgement.
    ///
    /// Returns [`RpcError::Busy`] rather than waiting when another call holds
    /// the connection.
    pub(crate) fn quit(&self, timeout: Duration) -> Result<(), RpcError> {
        let mut guard = self.try_stream()?;
        set_read_timeout(&guard, Some(timeout))?;
        self.call_locked(&mut guard, CONTROL_SERVICE, QUIT_METHOD, Value::Null)
            .map(drop)
    }

    /// Builds the stub for the named capability.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::UnknownPlugin`] when the name is not in the
    /// negotiated set, or [`RpcError::Closed`] after close.
    pub fn dispense(self: &Arc<Self>, name: &str) -> Result<Box<dyn Any + Send>, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let plugin = self
            .plugins
            .get(name)
            .ok_or_else(|| RpcError::UnknownPlugin {
                name: name.to_owned(),
                available: self.plugins.names(),
            })?;
        debug!(target: RPC_TARGET, plugin = name, "dispensing plugin");
        Ok(plugin.client(RpcCaller::new(Arc::clone(self), name)))
    }

    /// Builds the stub for the named capability and downcasts it to `T`.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::dispense`], plus [`RpcError::StubType`] when the stub
    /// is not a `T`.
    pub fn dispense_as<T: Any>(self: &Arc<Self>, name: &str) -> Result<T, RpcError> {
        let stub = self.dispense(name)?;
        stub.downcast::<T>()
            .map(|typed| *typed)
            .map_err(|_| RpcError::StubType {
                name: name.to_owned(),
                expected: type_name::<T>(),
            })
    }

    /// Names of the capabilities this client can dispense.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.names()
    }

    /// Closes the connection. Idempotent and non-blocking: a call in flight
    /// fails with a transport error and releases the stream as it returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(closer) = &self.closer
            && let Err(error) = closer.shutdown()
        {
            debug!(target: RPC_TARGET, %error, "rpc connection shutdown failed");
        }
        match self.try_stream() {
            Ok(mut guard) => release(guard.take()),
            Err(_) => {
                debug!(target: RPC_TARGET, "rpc call in flight; stream released when it returns");
            }
        }
        debug!(target: RPC_TARGET, "rpc connection closed");
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn set_read_timeout(
    guard: &MutexGuard<'_, Stream>,
    timeout: Option<Duration>,
) -> Result<(), RpcError> {
    let Some(stream) = guard.as_ref() else {
        return Err(RpcError::Closed);
    };
    let floored = timeout.map(|limit| limit.max(Duration::from_millis(1)));
    Ok(stream.get_ref().set_read_timeout(floored)?)
}

fn release(taken: Stream) {
    if let Some(stream) = taken
        && let Err(error) = stream.get_ref().shutdown()
    {
        debug!(target: RPC_TARGET, %error, "rpc connection shutdown failed");
    }
}

fn exchange(
    stream: &mut BufReader<Connection>,
    request: &RpcRequest,
) -> Result<RpcResponse, RpcError> {
    write_frame(stream.get_mut(), request)?;
    let response: RpcResponse = read_frame(stream)?.ok_or(RpcError::Closed)?;
    if response.id() != request.id() {
        return Err(RpcError::MismatchedResponse {
            expected: request.id(),
            received: response.id(),
        });
    }
    Ok(response)
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("plugins", &self.plugins)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
