//! Session detachment for spawned plugins.
//!
//! A plugin placed in its own session does not receive the terminal signals
//! (such as Ctrl-C) delivered to the host's process group, so the host stays
//! in charge of when the plugin is stopped.

use std::fmt;
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

use crate::supervisor::PROCESS_TARGET;

/// Abstraction over platform-specific session detachment.
pub trait Detacher: Send + Sync + fmt::Debug {
    /// Adjusts `command` so the spawned child starts detached.
    fn prepare(&self, command: &mut Command);
}

/// Detacher that leaves the child in the host's session.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDetach;

impl Detacher for NoDetach {
    fn prepare(&self, _command: &mut Command) {}
}

/// Detacher that calls `setsid(2)` in the child before `exec`.
///
/// The child also starts with `SIGPIPE` ignored, so once the host exits and
/// the plugin's output pipes lose their reader, writes fail with `EPIPE`
/// rather than killing the plugin.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionDetacher;

#[cfg(unix)]
impl Detacher for SessionDetacher {
    fn prepare(&self, command: &mut Command) {
        use std::os::unix::process::CommandExt as _;

        use nix::sys::signal::{SigHandler, Signal};

        debug!(target: PROCESS_TARGET, "plugin will start in a new session");
        // SAFETY: the closure runs between fork and exec and only calls
        // setsid and signal, which are async-signal-safe and allocate nothing.
        // No handler is installed; the disposition survives exec.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }
    }
}

/// Returns the session detacher for this platform.
///
/// On platforms without sessions this is a no-op.
#[must_use]
pub fn platform_detacher() -> Arc<dyn Detacher> {
    #[cfg(unix)]
    {
        Arc::new(SessionDetacher)
    }
    #[cfg(not(unix))]
    {
        debug!(target: PROCESS_TARGET, "session detachment unsupported on this platform");
        Arc::new(NoDetach)
    }
}
