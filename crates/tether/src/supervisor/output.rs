//! Draining of plugin stdout and stderr.
//!
//! Stdout carries the handshake line first; every later line on either
//! stream is diagnostic output that is logged and optionally copied into a
//! caller-supplied sink.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{OUTPUT_TARGET, StartupEvent};

/// Shared writer receiving a copy of plugin output.
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Which plugin stream a drain reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    const fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Counts live drain threads so teardown can wait for them to flush.
#[derive(Debug, Clone, Default)]
pub(crate) struct DrainTracker {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl DrainTracker {
    fn enter(&self) -> DrainGuard {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        DrainGuard {
            tracker: self.clone(),
        }
    }

    /// Waits until every drain finished or `timeout` elapses.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut live = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while *live > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(live, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            live = guard;
        }
        true
    }
}

struct DrainGuard {
    tracker: DrainTracker,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.tracker.inner;
        let mut live = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *live = live.saturating_sub(1);
        cvar.notify_all();
    }
}

/// Starts a thread that drains `reader` line by line.
///
/// For stdout, the first line is sent on `handshake` instead of being
/// forwarded; end of stream before that line is reported as
/// [`StartupEvent::StdoutClosed`].
pub(crate) fn spawn_drain<R>(
    stream: Stream,
    reader: R,
    pid: u32,
    sink: Option<OutputSink>,
    handshake: Option<Sender<StartupEvent>>,
    tracker: &DrainTracker,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let guard = tracker.enter();
    thread::Builder::new()
        .name(format!("tether-{}-{pid}", stream.label()))
        .spawn(move || {
            let _guard = guard;
            drain(stream, reader, pid, sink.as_ref(), handshake);
        })
}

fn drain<R: Read>(
    stream: Stream,
    reader: R,
    pid: u32,
    sink: Option<&OutputSink>,
    mut handshake: Option<Sender<StartupEvent>>,
) {
    let mut lines = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match lines.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(
                    target: OUTPUT_TARGET,
                    pid,
                    stream = stream.label(),
                    %error,
                    "failed to read plugin output"
                );
                break;
            }
        }
        // Plugin output is not guaranteed to be UTF-8.
        let buffer = String::from_utf8_lossy(&raw);
        if let Some(sender) = handshake.take() {
            if sender.send(StartupEvent::Line(buffer.into_owned())).is_err() {
                debug!(target: OUTPUT_TARGET, pid, "handshake receiver gone");
            }
            continue;
        }
        forward(stream, pid, &buffer, sink);
    }
    if let Some(sender) = handshake {
        if sender.send(StartupEvent::StdoutClosed).is_err() {
            debug!(target: OUTPUT_TARGET, pid, "handshake receiver gone");
        }
    }
    debug!(target: OUTPUT_TARGET, pid, stream = stream.label(), "plugin stream closed");
}

fn forward(stream: Stream, pid: u32, line: &str, sink: Option<&OutputSink>) {
    let text = line.trim_end_matches(['\r', '\n']);
    debug!(target: OUTPUT_TARGET, pid, stream = stream.label(), line = text, "plugin output");
    if let Some(sink) = sink {
        let mut writer = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(error) = writeln!(writer, "{text}") {
            warn!(target: OUTPUT_TARGET, pid, %error, "failed to copy plugin output to sink");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::mpsc;

    use super::*;

    fn shared_buffer() -> (Arc<Mutex<Vec<u8>>>, OutputSink) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink: OutputSink = buffer.clone();
        (buffer, sink)
    }

    #[test]
    fn first_stdout_line_goes_to_handshake_only() {
        let (buffer, sink) = shared_buffer();
        let (tx, rx) = mpsc::channel();
        let tracker = DrainTracker::default();
        let input = Cursor::new(b"1|1|tcp|127.0.0.1:1|rpc\nhello\nworld\n".to_vec());

        let handle = spawn_drain(Stream::Stdout, input, 1, Some(sink), Some(tx), &tracker)
            .expect("spawn drain");
        handle.join().expect("drain thread");

        match rx.recv().expect("handshake event") {
            StartupEvent::Line(line) => assert_eq!(line, "1|1|tcp|127.0.0.1:1|rpc\n"),
            other => panic!("unexpected event {other:?}"),
        }
        let copied = buffer.lock().expect("sink lock").clone();
        assert_eq!(String::from_utf8(copied).expect("utf8"), "hello\nworld\n");
        assert!(tracker.wait_idle(Duration::ZERO));
    }

    #[test]
    fn empty_stdout_reports_closed() {
        let (tx, rx) = mpsc::channel();
        let tracker = DrainTracker::default();
        let handle = spawn_drain(
            Stream::Stdout,
            Cursor::new(Vec::new()),
            1,
            None,
            Some(tx),
            &tracker,
        )
        .expect("spawn drain");
        handle.join().expect("drain thread");
        assert!(matches!(rx.recv(), Ok(StartupEvent::StdoutClosed)));
    }

    #[test]
    fn stderr_lines_are_all_forwarded() {
        let (buffer, sink) = shared_buffer();
        let tracker = DrainTracker::default();
        let handle = spawn_drain(
            Stream::Stderr,
            Cursor::new(b"warn: a\nwarn: b\n".to_vec()),
            1,
            Some(sink),
            None,
            &tracker,
        )
        .expect("spawn drain");
        handle.join().expect("drain thread");
        let copied = buffer.lock().expect("sink lock").clone();
        assert_eq!(copied, b"warn: a\nwarn: b\n");
    }
}
