//! The plugin lifecycle state machine.
//!
//! A [`Client`] acquires a plugin process (by spawning it or adopting one
//! described by a [`ReattachConfig`]), validates its handshake, dials its
//! endpoint, and hands out the resulting [`RpcClient`]. The supervisor's
//! watcher fires the client's exit signal when the process goes away; the
//! signal is the single source of truth for [`Client::exited`]. A plugin that
//! exits on its own has its connection closed when the signal fires.
//!
//! All methods take `&self` and may be called from any thread.

mod config;
mod launch;
mod state;

use std::fmt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use self::config::{ClientConfig, PluginCommand};
pub use self::state::ClientState;
use self::launch::Established;
use crate::context::{Context, ContextError};
use crate::error::{ClientError, MisuseError};
use crate::reattach::ReattachConfig;
use crate::rpc::RpcClient;
use crate::signal::ExitSignal;
use crate::supervisor::ProcessHandle;

/// Log target for lifecycle transitions.
pub(crate) const CLIENT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::client");

#[derive(Default)]
struct Inner {
    state: ClientState,
    torn_down: bool,
    process: Option<Arc<ProcessHandle>>,
    rpc: Option<Arc<RpcClient>>,
    reattach: Option<ReattachConfig>,
    negotiated: Option<(u32, u32)>,
    certificate: Option<Vec<u8>>,
}

/// Shared state behind a [`Client`] and any registry entries for it.
pub(crate) struct ClientCore {
    config: ClientConfig,
    inner: Mutex<Inner>,
    exit: ExitSignal,
    abort: ExitSignal,
    settled: ExitSignal,
    teardown: Mutex<()>,
}

/// Controller for one plugin process.
///
/// Cloning yields another handle to the same client. Dropping the last handle
/// does not kill the plugin; call [`Client::kill`] (or
/// [`ClientRegistry::kill_all`](crate::ClientRegistry::kill_all)) for that.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Creates an unstarted client. Configuration problems are reported by
    /// [`Client::start`].
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            core: Arc::new(ClientCore {
                config,
                inner: Mutex::new(Inner::default()),
                exit: ExitSignal::new(),
                abort: ExitSignal::new(),
                settled: ExitSignal::new(),
                teardown: Mutex::new(()),
            }),
        }
    }

    pub(crate) const fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    /// Starts the plugin (or attaches to it) and returns the connected RPC
    /// client.
    ///
    /// Valid only once per client. On error the client is left `Failed` with
    /// no process or connection leaked; construct a new client to retry.
    /// Cancelling `ctx` aborts spawning, the handshake wait, and dialing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Misuse`] when called twice, and otherwise the
    /// configuration, spawn, handshake, liveness, or connection error that
    /// stopped the start.
    pub fn start(&self, ctx: &Context) -> Result<Arc<RpcClient>, ClientError> {
        {
            let mut inner = self.core.lock();
            if inner.state != ClientState::Unstarted {
                return Err(MisuseError::AlreadyStarted { state: inner.state }.into());
            }
            inner.state = ClientState::Starting;
        }
        let start_ctx = ctx.linked(self.core.abort.clone());
        let outcome = self
            .core
            .config
            .validate()
            .map_err(ClientError::from)
            .and_then(|()| launch::launch(&self.core, &start_ctx));
        let result = self.core.settle(outcome, &start_ctx);
        self.core.settled.fire();
        if result.is_ok() {
            self.core.reap_on_exit();
            if let Some(registry) = self.core.config.registry() {
                registry.register(self);
            }
        }
        result
    }

    /// Returns the connected RPC client. Repeated calls return the same
    /// handle.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Watcher`] when the watcher lost track of the
    /// process, [`ClientError::Misuse`] before the client connects or after
    /// it reaches a terminal state, and [`ClientError::Cancelled`] when `ctx`
    /// is already done.
    pub fn client(&self, ctx: &Context) -> Result<Arc<RpcClient>, ClientError> {
        ctx.check()?;
        let inner = self.core.lock();
        if let Some(process) = &inner.process
            && let Some(source) = process.watcher_error()
        {
            return Err(ClientError::Watcher {
                pid: process.pid(),
                source,
            });
        }
        let state = self.core.observed(&inner);
        match (state, &inner.rpc) {
            (ClientState::Connected, Some(rpc)) => Ok(Arc::clone(rpc)),
            (state, _) if state.is_terminal() => Err(MisuseError::Terminal { state }.into()),
            (state, _) => Err(MisuseError::NotConnected { state }.into()),
        }
    }

    /// Whether the plugin has exited or the client was killed or failed.
    /// Never blocks; once `true` it stays `true`.
    #[must_use]
    pub fn exited(&self) -> bool {
        self.core.exited()
    }

    /// Blocks until [`Client::exited`] would return `true` or `timeout`
    /// elapses. Returns whether it did.
    #[must_use]
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        self.core.exit.wait_timeout(timeout)
    }

    /// Blocks until the plugin exits or the client is killed.
    pub fn wait(&self) {
        self.core.exit.wait();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        let inner = self.core.lock();
        self.core.observed(&inner)
    }

    /// Descriptor another client can use to attach to the same plugin.
    /// Present once connected, or immediately when the client was itself
    /// configured to reattach.
    #[must_use]
    pub fn reattach_config(&self) -> Option<ReattachConfig> {
        self.core
            .lock()
            .reattach
            .clone()
            .or_else(|| self.core.config.reattach().cloned())
    }

    /// Negotiated `(core, app)` protocol versions once connected.
    #[must_use]
    pub fn negotiated_version(&self) -> Option<(u32, u32)> {
        self.core.lock().negotiated
    }

    /// Server certificate the plugin announced, if any.
    #[must_use]
    pub fn server_certificate(&self) -> Option<Vec<u8>> {
        self.core.lock().certificate.clone()
    }

    /// Process id of the supervised plugin.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.core.lock().process.as_ref().map(|process| process.pid())
    }

    /// Exit status, when the plugin was spawned by this client and has
    /// exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.core
            .lock()
            .process
            .as_ref()
            .and_then(|process| process.exit_status())
    }

    /// Shuts the plugin down and releases every resource.
    ///
    /// Owned processes are asked to quit over RPC, then sent a termination
    /// signal, then force-killed after the grace period. Processes adopted
    /// without ownership are only disconnected. The quit request is skipped
    /// while another call holds the connection, and closing the connection
    /// fails that call rather than waiting for it. Idempotent, safe to call
    /// concurrently and from any state, and returns only once cleanup has
    /// finished.
    pub fn kill(&self, ctx: &Context) {
        self.core.kill(ctx);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl ClientCore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// State with the watcher's observation folded in.
    fn observed(&self, inner: &Inner) -> ClientState {
        if inner.state == ClientState::Connected && self.exit.is_fired() {
            ClientState::Exited
        } else {
            inner.state
        }
    }

    pub(crate) fn exited(&self) -> bool {
        self.exit.is_fired()
    }

    /// Records the outcome of a start attempt.
    fn settle(
        &self,
        outcome: Result<Established, ClientError>,
        ctx: &Context,
    ) -> Result<Arc<RpcClient>, ClientError> {
        let mut inner = self.lock();
        let established = match outcome {
            Ok(established) => established,
            Err(error) => {
                inner.state = if self.abort.is_fired() {
                    ClientState::Killed
                } else {
                    ClientState::Failed
                };
                inner.torn_down = true;
                drop(inner);
                self.exit.fire();
                info!(target: CLIENT_TARGET, %error, "plugin client failed to start");
                return Err(error);
            }
        };
        if self.abort.is_fired() {
            inner.state = ClientState::Killed;
            inner.torn_down = true;
            drop(inner);
            established.abandon(self.config.timeouts().kill_grace(), ctx);
            self.exit.fire();
            return Err(ContextError::Cancelled.into());
        }

        let rpc = Arc::clone(&established.rpc);
        info!(
            target: CLIENT_TARGET,
            pid = established.process.pid(),
            core_version = established.negotiated.0,
            app_version = established.negotiated.1,
            "plugin client connected"
        );
        inner.state = ClientState::Connected;
        inner.process = Some(established.process);
        inner.rpc = Some(established.rpc);
        inner.reattach = Some(established.reattach);
        inner.negotiated = Some(established.negotiated);
        inner.certificate = established.certificate;
        Ok(rpc)
    }

    /// Closes the connection and joins the supervisor threads once the
    /// plugin exits on its own, without waiting for [`ClientCore::kill`].
    fn reap_on_exit(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let exit = self.exit.clone();
        let spawned = thread::Builder::new()
            .name("tether-reaper".into())
            .spawn(move || {
                exit.wait();
                if let Some(core) = weak.upgrade() {
                    core.reap();
                }
            });
        if let Err(error) = spawned {
            warn!(
                target: CLIENT_TARGET,
                %error,
                "could not spawn exit reaper; teardown waits for kill"
            );
        }
    }

    fn reap(&self) {
        let _teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);
        let (process, rpc) = {
            let mut inner = self.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            inner.state = ClientState::Exited;
            (inner.process.clone(), inner.rpc.take())
        };
        if let Some(rpc) = rpc {
            rpc.close();
        }
        if let Some(process) = process {
            process.terminate(self.config.timeouts().kill_grace(), &Context::background());
        }
        info!(target: CLIENT_TARGET, "plugin exited; connection closed");
    }

    pub(crate) fn kill(&self, ctx: &Context) {
        let _teardown = self.teardown.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                ClientState::Unstarted => {
                    inner.state = ClientState::Killed;
                    inner.torn_down = true;
                    drop(inner);
                    self.exit.fire();
                    return;
                }
                ClientState::Starting => {
                    drop(inner);
                    debug!(target: CLIENT_TARGET, "aborting plugin start");
                    self.abort.fire();
                    self.settled.wait();
                }
                _ => {}
            }
        }

        let (process, rpc) = {
            let mut inner = self.lock();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            inner.state = if self.exit.is_fired() {
                ClientState::Exited
            } else {
                ClientState::Killed
            };
            (inner.process.clone(), inner.rpc.take())
        };

        let grace = self.config.timeouts().kill_grace();
        if let Some(rpc) = rpc {
            if let Some(process) = &process
                && process.owned()
                && !process.has_exited()
            {
                request_quit(&rpc, process, ctx.bound(grace));
            }
            rpc.close();
        }
        if let Some(process) = process {
            process.terminate(grace, ctx);
        }
        self.exit.fire();
        info!(target: CLIENT_TARGET, "plugin client killed");
    }
}

fn request_quit(rpc: &RpcClient, process: &ProcessHandle, budget: Duration) {
    match rpc.quit(budget) {
        Ok(()) if process.wait_exit(budget) => {
            debug!(target: CLIENT_TARGET, pid = process.pid(), "plugin quit on request");
        }
        Ok(()) => {
            debug!(target: CLIENT_TARGET, pid = process.pid(), "plugin acknowledged quit but kept running");
        }
        Err(error) => {
            debug!(target: CLIENT_TARGET, pid = process.pid(), %error, "quit request failed");
        }
    }
}
