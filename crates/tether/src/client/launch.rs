//! Acquiring a process and connecting to it.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{CLIENT_TARGET, ClientCore, PluginCommand};
use crate::context::Context;
use crate::error::{ClientError, ConfigError};
use crate::handshake::{self, HandshakeError, HandshakeLine, ProtocolKind};
use crate::negotiator;
use crate::reattach::{LivenessTest, ReattachConfig};
use crate::rpc::{PluginSet, RpcClient, RpcError};
use crate::supervisor::{self, LivenessProbe, ProbeError, ProcessHandle, StartupEvent};

/// Longest single wait on the startup channel between context checks.
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// How long a liveness ping may wait for its answer.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a successful start produces.
pub(super) struct Established {
    pub(super) process: Arc<ProcessHandle>,
    pub(super) rpc: Arc<RpcClient>,
    pub(super) reattach: ReattachConfig,
    pub(super) negotiated: (u32, u32),
    pub(super) certificate: Option<Vec<u8>>,
}

impl Established {
    /// Tears down a start that completed after the client was killed.
    pub(super) fn abandon(self, grace: Duration, ctx: &Context) {
        self.rpc.close();
        self.process.terminate(grace, ctx);
    }
}

pub(super) fn launch(core: &ClientCore, ctx: &Context) -> Result<Established, ClientError> {
    ctx.check()?;
    if let Some(reattach) = core.config.reattach() {
        return attach(core, reattach, ctx);
    }
    let Some(command) = core.config.command() else {
        return Err(ConfigError::MissingSource.into());
    };
    spawn(core, command, ctx)
}

fn spawn(
    core: &ClientCore,
    command: &PluginCommand,
    ctx: &Context,
) -> Result<Established, ClientError> {
    let detacher = core.config.detacher();
    let spawned = supervisor::spawn(
        core.config.build_command(command),
        detacher.as_ref(),
        core.config.sinks(),
        core.exit.clone(),
    )?;
    let process = spawned.handle;
    match connect_spawned(core, &process, &spawned.startup, ctx) {
        Ok((rpc, line)) => {
            let reattach = ReattachConfig::new(
                process.pid(),
                line.endpoint().clone(),
                line.protocol(),
                line.app_version(),
            )
            .with_core_version(line.core_version());
            Ok(Established {
                process,
                rpc,
                reattach,
                negotiated: (line.core_version(), line.app_version()),
                certificate: line.server_certificate().map(<[u8]>::to_vec),
            })
        }
        Err(error) => {
            debug!(target: CLIENT_TARGET, pid = process.pid(), %error, "cleaning up failed start");
            process.terminate(core.config.timeouts().kill_grace(), ctx);
            Err(error)
        }
    }
}

fn connect_spawned(
    core: &ClientCore,
    process: &ProcessHandle,
    startup: &Receiver<StartupEvent>,
    ctx: &Context,
) -> Result<(Arc<RpcClient>, HandshakeLine), ClientError> {
    let raw = wait_for_handshake(process, startup, core.config.timeouts().startup(), ctx)?;
    let line = handshake::parse(&raw, core.config.core_versions())?;
    debug!(
        target: CLIENT_TARGET,
        pid = process.pid(),
        endpoint = %line.endpoint(),
        protocol = %line.protocol(),
        "received plugin handshake"
    );
    let plugins = select_plugins(core, line.app_version(), line.protocol())?;
    let connection = negotiator::dial(
        line.endpoint(),
        line.server_certificate(),
        &core.config.dial_policy(),
        ctx,
    )?;
    Ok((RpcClient::new(connection, plugins), line))
}

/// Waits for the first stdout line, the process exit, the startup timeout,
/// or the context, whichever comes first.
fn wait_for_handshake(
    process: &ProcessHandle,
    startup: &Receiver<StartupEvent>,
    timeout: Duration,
    ctx: &Context,
) -> Result<String, ClientError> {
    let started = Instant::now();
    loop {
        ctx.check()?;
        let waited = started.elapsed();
        let Some(left) = timeout.checked_sub(waited).filter(|left| !left.is_zero()) else {
            return Err(HandshakeError::Timeout {
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            }
            .into());
        };
        match startup.recv_timeout(ctx.bound(left.min(HANDSHAKE_POLL))) {
            Ok(StartupEvent::Line(line)) => return Ok(line),
            Ok(StartupEvent::Exited(code)) => {
                return Err(HandshakeError::ExitedBeforeHandshake { code }.into());
            }
            Ok(StartupEvent::StdoutClosed) => {
                debug!(target: CLIENT_TARGET, pid = process.pid(), "plugin closed stdout before handshake");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                let code = process.exit_status().and_then(|status| status.code());
                return Err(HandshakeError::ExitedBeforeHandshake { code }.into());
            }
        }
    }
}

/// Applies the protocol allow-list and picks the plugin set for the
/// announced application version.
fn select_plugins(
    core: &ClientCore,
    app_version: u32,
    protocol: ProtocolKind,
) -> Result<PluginSet, ClientError> {
    let allowed = core.config.allowed_protocols();
    if !allowed.contains(&protocol) {
        return Err(HandshakeError::ProtocolNotAllowed {
            protocol,
            allowed: allowed.to_vec(),
        }
        .into());
    }
    let mut sets = core.config.plugin_sets();
    sets.remove(&app_version).ok_or_else(|| {
        HandshakeError::UnsupportedAppVersion {
            supported: sets.keys().rev().copied().collect(),
            claimed: app_version,
        }
        .into()
    })
}

fn attach(
    core: &ClientCore,
    reattach: &ReattachConfig,
    ctx: &Context,
) -> Result<Established, ClientError> {
    let supported = core.config.core_versions();
    if !supported.contains(&reattach.core_version()) {
        return Err(HandshakeError::UnsupportedCoreVersion {
            supported: supported.to_vec(),
            claimed: reattach.core_version(),
        }
        .into());
    }
    let plugins = select_plugins(core, reattach.app_version(), reattach.protocol())?;
    let pid = reattach.pid();
    let policy = core.config.dial_policy();

    let (process, rpc) = match reattach.test() {
        LivenessTest::Signal => {
            let probe = core.config.liveness_probe();
            verify_alive(probe.as_ref(), pid)?;
            let process = adopt(core, reattach, probe)?;
            match negotiator::dial(reattach.endpoint(), None, &policy, ctx) {
                Ok(connection) => (process, RpcClient::new(connection, plugins)),
                Err(error) => {
                    process.release();
                    return Err(error.into());
                }
            }
        }
        LivenessTest::Ping => {
            let connection = negotiator::dial(reattach.endpoint(), None, &policy, ctx)?;
            let rpc = RpcClient::new(connection, plugins);
            if let Err(error) = rpc.ping() {
                debug!(target: CLIENT_TARGET, pid, %error, "reattached plugin did not answer ping");
                rpc.close();
                return Err(ClientError::ProcessNotAlive { pid });
            }
            let probe = Arc::new(PingProbe {
                rpc: Arc::downgrade(&rpc),
            });
            match adopt(core, reattach, probe) {
                Ok(process) => (process, rpc),
                Err(error) => {
                    rpc.close();
                    return Err(error);
                }
            }
        }
    };
    info!(target: CLIENT_TARGET, pid, owned = reattach.owned(), "reattached to plugin");
    Ok(Established {
        process,
        rpc,
        reattach: reattach.clone(),
        negotiated: (reattach.core_version(), reattach.app_version()),
        certificate: None,
    })
}

fn verify_alive(probe: &dyn LivenessProbe, pid: u32) -> Result<(), ClientError> {
    match probe.is_alive(pid) {
        Ok(true) => Ok(()),
        Ok(false) => Err(ClientError::ProcessNotAlive { pid }),
        Err(source) => Err(ClientError::Probe { pid, source }),
    }
}

fn adopt(
    core: &ClientCore,
    reattach: &ReattachConfig,
    probe: Arc<dyn LivenessProbe>,
) -> Result<Arc<ProcessHandle>, ClientError> {
    let pid = reattach.pid();
    supervisor::adopt(pid, reattach.owned(), probe, core.exit.clone())
        .map_err(|source| ClientError::Adopt { pid, source })
}

/// Treats the plugin as alive while it answers control pings. A call in
/// flight on the connection counts as an answer.
struct PingProbe {
    rpc: Weak<RpcClient>,
}

impl LivenessProbe for PingProbe {
    fn is_alive(&self, _pid: u32) -> Result<bool, ProbeError> {
        let Some(rpc) = self.rpc.upgrade() else {
            return Ok(false);
        };
        Ok(matches!(
            rpc.ping_within(PING_TIMEOUT),
            Ok(()) | Err(RpcError::Busy)
        ))
    }
}
