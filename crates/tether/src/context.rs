//! Cancellation and deadline scope for blocking lifecycle operations.
//!
//! `Start`, `Client`, and `Kill` all take a [`Context`]. A context carries an
//! optional absolute deadline and any number of cancellation signals; blocking
//! waits inside the controller are bounded by both.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::signal::ExitSignal;

/// Upper bound on a single uninterrupted sleep while honouring cancellation.
const CANCEL_SLICE: Duration = Duration::from_millis(25);

/// Reason a context stopped an operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// A cancel handle fired.
    #[error("operation cancelled")]
    Cancelled,
    /// The context deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation and deadline scope.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    signals: Vec<ExitSignal>,
}

/// Handle that cancels the [`Context`] it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    signal: ExitSignal,
}

impl CancelHandle {
    /// Cancels the associated context and every context derived from it.
    pub fn cancel(&self) {
        self.signal.fire();
    }
}

impl Context {
    /// A context that never expires and cannot be cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_in(timeout)
    }

    /// Derives a context whose deadline is the earlier of the current one and
    /// `timeout` from now.
    #[must_use]
    pub fn deadline_in(&self, timeout: Duration) -> Self {
        let candidate = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, candidate) {
            (Some(current), Some(candidate)) => Some(current.min(candidate)),
            (current, None) => current,
            (None, candidate) => candidate,
        };
        Self {
            deadline,
            signals: self.signals.clone(),
        }
    }

    /// Derives a cancellable child context.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let signal = ExitSignal::new();
        let child = self.linked(signal.clone());
        (child, CancelHandle { signal })
    }

    /// Derives a context that is also cancelled when `signal` fires.
    #[must_use]
    pub(crate) fn linked(&self, signal: ExitSignal) -> Self {
        let mut signals = self.signals.clone();
        signals.push(signal);
        Self {
            deadline: self.deadline,
            signals,
        }
    }

    /// Absolute deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clamps `limit` to the time remaining before the deadline.
    #[must_use]
    pub fn bound(&self, limit: Duration) -> Duration {
        self.remaining().map_or(limit, |remaining| remaining.min(limit))
    }

    /// Reports whether any cancel handle has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(ExitSignal::is_fired)
    }

    /// Checks the context without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Cancelled`] when cancelled and
    /// [`ContextError::DeadlineExceeded`] once the deadline has passed.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.remaining() {
            Some(remaining) if remaining.is_zero() => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration`, waking early on cancellation or deadline.
    ///
    /// # Errors
    ///
    /// Returns the [`ContextError`] that interrupted the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        let until = Instant::now().checked_add(duration);
        loop {
            self.check()?;
            let left = until.map_or(CANCEL_SLICE, |until| {
                until.saturating_duration_since(Instant::now())
            });
            if left.is_zero() {
                return Ok(());
            }
            let slice = self.bound(left.min(CANCEL_SLICE));
            match self.signals.first() {
                Some(signal) => {
                    if signal.wait_timeout(slice) {
                        return Err(ContextError::Cancelled);
                    }
                }
                None => std::thread::sleep(slice),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_expires() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert_eq!(ctx.remaining(), None);
        assert_eq!(ctx.bound(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn expired_deadline_is_reported() {
        let ctx = Context::with_timeout(Duration::ZERO);
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
    }

    #[test]
    fn nested_deadline_keeps_the_earlier_instant() {
        let outer = Context::with_timeout(Duration::from_millis(50));
        let inner = outer.deadline_in(Duration::from_secs(60));
        assert_eq!(inner.deadline(), outer.deadline());
    }

    #[test]
    fn cancel_propagates_to_derived_contexts() {
        let (ctx, handle) = Context::background().with_cancel();
        let derived = ctx.deadline_in(Duration::from_secs(60));
        handle.cancel();
        assert_eq!(ctx.check(), Err(ContextError::Cancelled));
        assert_eq!(derived.check(), Err(ContextError::Cancelled));
    }

    #[test]
    fn sleep_wakes_on_cancel() {
        let (ctx, handle) = Context::background().with_cancel();
        let sleeper = std::thread::spawn(move || ctx.sleep(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();
        let outcome = sleeper.join().expect("sleeper thread");
        assert_eq!(outcome, Err(ContextError::Cancelled));
    }

    #[test]
    fn sleep_completes_without_interruption() {
        let ctx = Context::background();
        let started = Instant::now();
        assert!(ctx.sleep(Duration::from_millis(40)).is_ok());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
