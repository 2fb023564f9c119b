//! Ownership and observation of the plugin OS process.
//!
//! The supervisor spawns the plugin (or adopts an already-running one), starts
//! exactly one watcher thread per process, and performs graceful-then-forced
//! termination. The watcher records the exit status before firing the shared
//! [`ExitSignal`], so any observer that sees the signal can also read the
//! status.

mod output;
mod probe;

use std::fs::{File, OpenOptions};
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::output::OutputSink;
use self::output::{DrainTracker, Stream, spawn_drain};
#[cfg(test)]
pub(crate) use self::probe::MockLivenessProbe;
pub use self::probe::{LivenessProbe, ProbeError, SignalProbe};
use crate::context::Context;
use crate::session::Detacher;
use crate::signal::ExitSignal;

/// Log target for process lifecycle events.
pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
/// Log target for forwarded plugin output.
pub(crate) const OUTPUT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::plugin_output");

/// Interval between liveness probes of an adopted process.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Wait after a forced kill before giving up on observing the exit.
const FORCED_EXIT_WAIT: Duration = Duration::from_secs(5);
/// Wait for output drains to flush once the process is gone.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

/// Startup progress reported to the handshake reader.
#[derive(Debug)]
pub(crate) enum StartupEvent {
    /// First stdout line, including its terminator.
    Line(String),
    /// Stdout reached end of stream before any line.
    StdoutClosed,
    /// The process exited; carries the exit code when there is one.
    Exited(Option<i32>),
}

/// Failure to start the plugin process.
#[derive(Debug, Error)]
#[error("failed to spawn plugin '{program}': {source}")]
pub struct SpawnError {
    /// Program that was being started.
    pub program: String,
    /// Underlying OS error.
    #[source]
    pub source: io::Error,
}

/// Where plugin output goes besides the log.
///
/// With `stderr_log` set, stderr is written straight to that file and never
/// passes through the host, so it survives the host exiting.
#[derive(Clone, Default)]
pub(crate) struct OutputSinks {
    pub(crate) stdout: Option<OutputSink>,
    pub(crate) stderr: Option<OutputSink>,
    pub(crate) stderr_log: Option<Utf8PathBuf>,
}

/// A freshly spawned plugin and the channel carrying its startup events.
pub(crate) struct Spawned {
    pub(crate) handle: Arc<ProcessHandle>,
    pub(crate) startup: Receiver<StartupEvent>,
}

#[derive(Default)]
struct ExitRecord {
    status: Option<ExitStatus>,
    watcher_error: Option<Arc<io::Error>>,
}

/// Supervised plugin process.
pub(crate) struct ProcessHandle {
    pid: u32,
    owned: bool,
    exit: ExitSignal,
    stop: ExitSignal,
    record: Mutex<ExitRecord>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    drains: DrainTracker,
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Terminate,
    Kill,
}

impl ProcessHandle {
    fn new(pid: u32, owned: bool, exit: ExitSignal) -> Arc<Self> {
        Arc::new(Self {
            pid,
            owned,
            exit,
            stop: ExitSignal::new(),
            record: Mutex::new(ExitRecord::default()),
            watcher: Mutex::new(None),
            drains: DrainTracker::default(),
        })
    }

    pub(crate) const fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) const fn owned(&self) -> bool {
        self.owned
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit.is_fired()
    }

    pub(crate) fn wait_exit(&self, timeout: Duration) -> bool {
        self.exit.wait_timeout(timeout)
    }

    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// Failure recorded by the watcher, if it could not observe the process.
    pub(crate) fn watcher_error(&self) -> Option<Arc<io::Error>> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .watcher_error
            .clone()
    }

    fn record_status(&self, status: ExitStatus) {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status = Some(status);
    }

    fn record_error(&self, error: io::Error) {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .watcher_error = Some(Arc::new(error));
    }

    fn install_watcher(&self, handle: JoinHandle<()>) {
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn join_watcher(&self) {
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if handle.is_some_and(|join| join.join().is_err()) {
            warn!(target: PROCESS_TARGET, pid = self.pid, "process watcher panicked");
        }
    }

    /// Stops supervising without touching the process.
    pub(crate) fn release(&self) {
        debug!(target: PROCESS_TARGET, pid = self.pid, "releasing plugin process");
        self.stop.fire();
        self.join_watcher();
        self.exit.fire();
    }

    /// Terminates an owned process: termination signal, grace period, then a
    /// forced kill. Processes without kill authority are only released.
    ///
    /// Returns once the exit has been observed or the forced path finished.
    pub(crate) fn terminate(&self, grace: Duration, ctx: &Context) {
        if !self.owned {
            self.release();
            return;
        }
        if !self.exit.is_fired() {
            self.escalate(grace, ctx);
        }
        if !self.exit.is_fired() {
            // The watcher may be stuck on an unkillable process; leave it.
            warn!(target: PROCESS_TARGET, pid = self.pid, "plugin exit not observed");
            self.stop.fire();
            self.exit.fire();
            return;
        }
        self.stop.fire();
        self.join_watcher();
        if !self.drains.wait_idle(DRAIN_WAIT) {
            debug!(target: PROCESS_TARGET, pid = self.pid, "plugin output still open after exit");
        }
    }

    fn escalate(&self, grace: Duration, ctx: &Context) {
        info!(target: PROCESS_TARGET, pid = self.pid, "terminating plugin");
        if !self.send(TermSignal::Terminate) {
            if !self.exit.wait_timeout(FORCED_EXIT_WAIT) {
                warn!(target: PROCESS_TARGET, pid = self.pid, "plugin vanished but exit not observed");
            }
            return;
        }
        let window = if ctx.is_cancelled() {
            Duration::ZERO
        } else {
            ctx.bound(grace)
        };
        if self.exit.wait_timeout(window) {
            debug!(target: PROCESS_TARGET, pid = self.pid, "plugin exited within grace period");
            return;
        }
        warn!(
            target: PROCESS_TARGET,
            pid = self.pid,
            grace_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            "plugin ignored termination request; forcing kill"
        );
        if self.send(TermSignal::Kill) && !self.exit.wait_timeout(FORCED_EXIT_WAIT) {
            warn!(target: PROCESS_TARGET, pid = self.pid, "plugin did not exit after forced kill");
        }
    }

    #[cfg(unix)]
    fn send(&self, signal: TermSignal) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};

        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        let sig = match signal {
            TermSignal::Terminate => Signal::SIGTERM,
            TermSignal::Kill => Signal::SIGKILL,
        };
        match kill(nix::unistd::Pid::from_raw(raw), sig) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(errno) => {
                warn!(target: PROCESS_TARGET, pid = self.pid, ?signal, %errno, "failed to signal plugin");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn send(&self, signal: TermSignal) -> bool {
        warn!(target: PROCESS_TARGET, pid = self.pid, ?signal, "signals unsupported on this platform");
        false
    }
}

/// Spawns the plugin and starts its watcher and output drains.
///
/// The command's stdio is overridden: stdin is null, stdout is piped, and
/// stderr is piped unless `sinks` names a log file for it. `exit` fires when
/// the watcher observes the process exit.
pub(crate) fn spawn(
    mut command: Command,
    detacher: &dyn Detacher,
    sinks: &OutputSinks,
    exit: ExitSignal,
) -> Result<Spawned, SpawnError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let stderr = match &sinks.stderr_log {
        Some(path) => Stdio::from(open_log(path).map_err(|source| SpawnError {
            program: program.clone(),
            source,
        })?),
        None => Stdio::piped(),
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(stderr);
    detacher.prepare(&mut command);

    let mut child = command.spawn().map_err(|source| SpawnError {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    info!(target: PROCESS_TARGET, pid, program = %program, "spawned plugin");

    let handle = ProcessHandle::new(pid, true, exit);
    let (tx, rx) = mpsc::channel();
    if let Err(source) = wire_child(&handle, &mut child, sinks, tx.clone()) {
        abandon(child, pid);
        return Err(SpawnError { program, source });
    }
    if let Err(source) = start_watcher(&handle, child, tx) {
        handle.send(TermSignal::Kill);
        return Err(SpawnError { program, source });
    }
    Ok(Spawned {
        handle,
        startup: rx,
    })
}

fn wire_child(
    handle: &Arc<ProcessHandle>,
    child: &mut Child,
    sinks: &OutputSinks,
    startup: Sender<StartupEvent>,
) -> io::Result<()> {
    let pid = handle.pid;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("plugin stdout was not captured"))?;
    spawn_drain(
        Stream::Stdout,
        stdout,
        pid,
        sinks.stdout.clone(),
        Some(startup),
        &handle.drains,
    )?;
    // Absent when stderr goes to a log file.
    if let Some(stderr) = child.stderr.take() {
        spawn_drain(
            Stream::Stderr,
            stderr,
            pid,
            sinks.stderr.clone(),
            None,
            &handle.drains,
        )?;
    }
    Ok(())
}

fn open_log(path: &Utf8Path) -> io::Result<File> {
    debug!(target: PROCESS_TARGET, path = %path, "plugin stderr goes to log file");
    OpenOptions::new().create(true).append(true).open(path)
}

fn abandon(mut child: Child, pid: u32) {
    warn!(target: PROCESS_TARGET, pid, "abandoning partially started plugin");
    if let Err(error) = child.kill() {
        debug!(target: PROCESS_TARGET, pid, %error, "kill failed");
    }
    if let Err(error) = child.wait() {
        debug!(target: PROCESS_TARGET, pid, %error, "reap failed");
    }
}

/// Starts the single watcher for a spawned child. The watcher is the only
/// code that reaps it.
fn start_watcher(
    handle: &Arc<ProcessHandle>,
    child: Child,
    startup: Sender<StartupEvent>,
) -> io::Result<()> {
    let watched = Arc::clone(handle);
    let join = thread::Builder::new()
        .name(format!("tether-watch-{}", handle.pid))
        .spawn(move || watch_child(&watched, child, &startup))?;
    handle.install_watcher(join);
    Ok(())
}

fn watch_child(handle: &ProcessHandle, mut child: Child, startup: &Sender<StartupEvent>) {
    let code = match child.wait() {
        Ok(status) => {
            info!(target: PROCESS_TARGET, pid = handle.pid, %status, "plugin exited");
            handle.record_status(status);
            status.code()
        }
        Err(error) => {
            warn!(target: PROCESS_TARGET, pid = handle.pid, %error, "failed to wait for plugin");
            handle.record_error(error);
            None
        }
    };
    if startup.send(StartupEvent::Exited(code)).is_err() {
        debug!(target: PROCESS_TARGET, pid = handle.pid, "startup already complete");
    }
    handle.exit.fire();
}

/// Adopts an already-running process and polls it with `probe`.
///
/// `owned` grants authority to terminate the process on kill.
pub(crate) fn adopt(
    pid: u32,
    owned: bool,
    probe: Arc<dyn LivenessProbe>,
    exit: ExitSignal,
) -> io::Result<Arc<ProcessHandle>> {
    let handle = ProcessHandle::new(pid, owned, exit);
    let watched = Arc::clone(&handle);
    let join = thread::Builder::new()
        .name(format!("tether-watch-{pid}"))
        .spawn(move || watch_adopted(&watched, probe.as_ref()))?;
    handle.install_watcher(join);
    info!(target: PROCESS_TARGET, pid, owned, "adopted running plugin");
    Ok(handle)
}

fn watch_adopted(handle: &ProcessHandle, probe: &dyn LivenessProbe) {
    while !handle.stop.wait_timeout(ADOPTED_POLL_INTERVAL) {
        match probe.is_alive(handle.pid) {
            Ok(true) => {}
            Ok(false) => {
                info!(target: PROCESS_TARGET, pid = handle.pid, "adopted plugin exited");
                break;
            }
            Err(error) => {
                warn!(target: PROCESS_TARGET, pid = handle.pid, %error, "liveness probe failed");
                handle.record_error(io::Error::other(error));
                break;
            }
        }
    }
    handle.exit.fire();
}
