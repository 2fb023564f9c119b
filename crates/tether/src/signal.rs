//! One-shot broadcast signal used for exit notification and cancellation.
//!
//! The signal starts unfired and can be fired exactly once. Any number of
//! threads may block on it; all of them wake on the single transition and any
//! thread arriving afterwards returns immediately, so there are no missed
//! wakeups.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Cloneable one-shot broadcast signal.
///
/// Clones share state: firing one clone wakes waiters on every clone.
///
/// # Example
///
/// ```
/// use std::thread;
/// use tether::ExitSignal;
///
/// let signal = ExitSignal::new();
/// let waiter = {
///     let signal = signal.clone();
///     thread::spawn(move || signal.wait())
/// };
/// assert!(signal.fire());
/// assert!(!signal.fire());
/// waiter.join().expect("waiter thread");
/// assert!(signal.is_fired());
/// ```
#[derive(Clone, Default)]
pub struct ExitSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ExitSignal {
    /// Creates an unfired signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal, waking every waiter.
    ///
    /// Returns `true` when this call performed the transition and `false`
    /// when the signal had already fired.
    pub fn fire(&self) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *fired {
            return false;
        }
        *fired = true;
        cvar.notify_all();
        true
    }

    /// Reports whether the signal has fired. Never blocks on a waiter.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*fired {
            fired = cvar.wait(fired).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the signal fires or `timeout` elapses.
    ///
    /// Returns `true` when the signal fired within the timeout.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*fired {
            let Some(deadline) = deadline else {
                fired = cvar.wait(fired).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(fired, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            fired = guard;
        }
        true
    }
}

impl fmt::Debug for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitSignal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use rstest::rstest;

    use super::*;

    #[test]
    fn fires_once() {
        let signal = ExitSignal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[test]
    fn wait_timeout_expires_when_unfired() {
        let signal = ExitSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn late_waiters_return_immediately() {
        let signal = ExitSignal::new();
        signal.fire();
        assert!(signal.wait_timeout(Duration::ZERO));
        signal.wait();
    }

    #[rstest]
    #[case(1)]
    #[case(8)]
    #[case(32)]
    fn every_concurrent_waiter_wakes_exactly_once(#[case] waiters: usize) {
        let signal = ExitSignal::new();
        let woken = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..waiters)
            .map(|_| {
                let signal = signal.clone();
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    signal.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(woken.load(Ordering::SeqCst), 0, "no waiter wakes early");
        signal.fire();
        for handle in handles {
            handle.join().expect("waiter thread");
        }
        assert_eq!(woken.load(Ordering::SeqCst), waiters);
    }
}
