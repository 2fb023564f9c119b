//! Unit tests for the client error taxonomy.

use std::io;

use rstest::rstest;

use super::*;

fn spawn_error() -> ClientError {
    ClientError::Spawn(SpawnError {
        program: "missing-plugin".into(),
        source: io::Error::from(io::ErrorKind::NotFound),
    })
}

#[rstest]
#[case::spawn(spawn_error(), ClientErrorKind::Unreachable)]
#[case::dead_pid(ClientError::ProcessNotAlive { pid: 7 }, ClientErrorKind::Unreachable)]
#[case::silent_exit(
    ClientError::Handshake(HandshakeError::ExitedBeforeHandshake { code: Some(0) }),
    ClientErrorKind::Unreachable
)]
#[case::dial_timeout(
    ClientError::Connect(ConnectError::Timeout {
        endpoint: "tcp://127.0.0.1:1".into(),
        window_ms: 10,
        attempts: 3,
        last: None,
    }),
    ClientErrorKind::Unreachable
)]
#[case::core_version(
    ClientError::Handshake(HandshakeError::UnsupportedCoreVersion {
        supported: vec![1],
        claimed: 9,
    }),
    ClientErrorKind::Incompatible
)]
#[case::garbage(
    ClientError::Handshake(HandshakeError::Format {
        line: "hello".into(),
        reason: "expected 5 or 6 fields, found 1".into(),
    }),
    ClientErrorKind::Incompatible
)]
#[case::tls(
    ClientError::Connect(ConnectError::TlsUnavailable {
        endpoint: "tcp://127.0.0.1:1".into(),
    }),
    ClientErrorKind::Incompatible
)]
#[case::dial_cancelled(
    ClientError::Connect(ConnectError::Cancelled {
        endpoint: "tcp://127.0.0.1:1".into(),
        reason: ContextError::Cancelled,
    }),
    ClientErrorKind::Cancelled
)]
#[case::deadline(
    ClientError::Cancelled(ContextError::DeadlineExceeded),
    ClientErrorKind::Cancelled
)]
#[case::misuse(
    ClientError::Misuse(MisuseError::AlreadyStarted { state: ClientState::Connected }),
    ClientErrorKind::Misuse
)]
#[case::config(ClientError::Config(ConfigError::EmptyPluginSet), ClientErrorKind::Config)]
fn errors_fold_into_actionable_kinds(#[case] error: ClientError, #[case] kind: ClientErrorKind) {
    assert_eq!(error.kind(), kind);
    assert_eq!(error.is_incompatible(), kind == ClientErrorKind::Incompatible);
    assert_eq!(error.is_unreachable(), kind == ClientErrorKind::Unreachable);
}

#[test]
fn version_mismatch_message_names_both_sides() {
    let error = ClientError::from(HandshakeError::UnsupportedCoreVersion {
        supported: vec![1, 2],
        claimed: 5,
    });
    let message = error.to_string();
    assert!(message.contains('5'), "expected claimed version: {message}");
    assert!(message.contains("[1, 2]"), "expected supported set: {message}");
}

#[test]
fn misuse_message_names_the_state() {
    let error = MisuseError::Terminal {
        state: ClientState::Killed,
    };
    assert!(error.to_string().contains("killed"));
}

#[test]
fn watcher_error_keeps_its_source() {
    let error = ClientError::Watcher {
        pid: 12,
        source: Arc::new(io::Error::other("probe failed")),
    };
    let source = std::error::Error::source(&error).expect("source");
    assert!(source.to_string().contains("probe failed"));
}
