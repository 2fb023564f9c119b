//! Liveness probes for processes the host did not necessarily spawn.

use thiserror::Error;

/// Errors raised while probing a process.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The pid cannot be represented on this platform.
    #[error("pid {pid} is out of range for this platform")]
    InvalidPid {
        /// Offending pid.
        pid: u32,
    },
    /// The operating system rejected the probe.
    #[cfg(unix)]
    #[error("failed to probe pid {pid}: {source}")]
    System {
        /// Probed pid.
        pid: u32,
        /// Underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
    /// Liveness probing is not available on this platform.
    #[error("process liveness probing is not supported on this platform")]
    Unsupported,
    /// A probe implementation reported a failure of its own.
    #[error("liveness probe failed: {message}")]
    Failed {
        /// Human-readable reason.
        message: String,
    },
}

/// Answers whether a process id refers to a live process.
#[cfg_attr(test, mockall::automock)]
pub trait LivenessProbe: Send + Sync {
    /// Returns `Ok(true)` when the process is alive.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] when liveness cannot be determined.
    fn is_alive(&self, pid: u32) -> Result<bool, ProbeError>;
}

/// Probe that sends the null signal to the pid.
///
/// A process owned by another user still counts as alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> Result<bool, ProbeError> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        if pid == 0 {
            return Ok(false);
        }
        let raw = i32::try_from(pid).map_err(|_| ProbeError::InvalidPid { pid })?;
        match kill(nix::unistd::Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH | Errno::ECHILD) => Ok(false),
            Err(source) => Err(ProbeError::System { pid, source }),
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> Result<bool, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}
