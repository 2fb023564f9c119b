//! End-to-end lifecycle tests driving the real plugin binary.
#![cfg(unix)]

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tether::handshake::HandshakeError;
use tether::{
    Client, ClientConfig, ClientError, ClientState, Context, LivenessProbe, OutputSink,
    PluginCommand, SignalProbe, Timeouts,
};
use tether_config::{LogFormat, NetworkKind, env};
use tether_test_plugin::{COOKIE_KEY, COOKIE_VALUE, TestStub, handshake_config, plugin_set};

const PLUGIN: &str = env!("CARGO_BIN_EXE_tether-test-plugin");

fn timeouts() -> Timeouts {
    Timeouts::default()
        .with_startup(Duration::from_secs(10))
        .with_dial_window(Duration::from_secs(5))
        .with_kill_grace(Duration::from_secs(2))
}

fn config(mode: &str) -> ClientConfig {
    ClientConfig::for_command(PluginCommand::new(PLUGIN).arg(mode))
        .with_handshake(handshake_config())
        .with_plugins(plugin_set())
        .with_timeouts(timeouts())
}

fn alive(pid: u32) -> bool {
    SignalProbe.is_alive(pid).expect("probe")
}

fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    condition()
}

fn sink() -> (Arc<Mutex<Vec<u8>>>, OutputSink) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let shared: Arc<Mutex<dyn Write + Send>> = buffer.clone();
    (buffer, shared)
}

fn text(buffer: &Mutex<Vec<u8>>) -> String {
    String::from_utf8_lossy(&buffer.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
}

#[fixture]
fn socket_dir() -> TempDir {
    TempDir::new().expect("temp dir")
}

// ---------------------------------------------------------------------------
// Well-behaved plugin
// ---------------------------------------------------------------------------

#[test]
fn plugin_serves_and_quits_on_kill() {
    let client = Client::new(config("serve"));
    let rpc = client.start(&Context::background()).expect("start");
    let stub: TestStub = rpc.dispense_as("test").expect("dispense");
    assert_eq!(stub.double(8).expect("double"), 16);

    let pid = client.pid().expect("pid");
    assert_eq!(stub.pid().expect("remote pid"), pid);
    assert_eq!(client.negotiated_version(), Some((1, 1)));

    client.kill(&Context::background());
    assert_eq!(client.state(), ClientState::Killed);
    let status = client.exit_status().expect("exit status");
    assert!(status.success(), "plugin should exit cleanly on quit: {status}");
    assert!(!alive(pid));
}

#[rstest]
fn plugin_serves_over_a_unix_socket(socket_dir: TempDir) {
    let dir = socket_dir.path().to_str().expect("utf-8 temp dir").to_owned();
    let client = Client::new(config("serve-unix").with_unix_socket_dir(dir.as_str()));
    let rpc = client.start(&Context::background()).expect("start");

    let reattach = client.reattach_config().expect("descriptor");
    assert_eq!(reattach.endpoint().network(), NetworkKind::Unix);
    let path = reattach.endpoint().unix_path().expect("socket path");
    assert!(path.as_str().starts_with(&dir), "{path} not under {dir}");

    let stub: TestStub = rpc.dispense_as("test").expect("dispense");
    assert_eq!(stub.double(-3).expect("double"), -6);
    client.kill(&Context::background());
}

#[test]
fn highest_shared_app_version_is_negotiated() {
    let config = config("serve")
        .with_versioned_plugins(1, plugin_set())
        .with_versioned_plugins(2, plugin_set());
    let client = Client::new(config);
    client.start(&Context::background()).expect("start");
    assert_eq!(client.negotiated_version(), Some((1, 2)));
    client.kill(&Context::background());
}

#[test]
fn plugin_logs_in_the_format_the_host_requests() {
    let (stderr, sink) = sink();
    let command = PluginCommand::new(PLUGIN)
        .arg("serve")
        .env(env::LOG_FORMAT, LogFormat::Json.to_string());
    let client = Client::new(config("serve").with_command(command).with_stderr_sink(sink));
    client.start(&Context::background()).expect("start");
    assert!(eventually(Duration::from_secs(5), || {
        text(&stderr).contains("\"message\":\"serving\"")
    }));
    client.kill(&Context::background());
}

#[test]
fn plugin_binds_inside_the_offered_port_range() {
    let client = Client::new(config("serve").with_port_range(47100, 47199));
    client.start(&Context::background()).expect("start");
    let reattach = client.reattach_config().expect("descriptor");
    let port: u16 = reattach
        .endpoint()
        .wire_address()
        .rsplit(':')
        .next()
        .and_then(|raw| raw.parse().ok())
        .expect("tcp port");
    assert!((47100..=47199).contains(&port), "port {port} outside the offered range");
    client.kill(&Context::background());
}

#[test]
fn plugin_stderr_reaches_the_host_sink() {
    let (stderr, sink) = sink();
    let client = Client::new(config("serve").with_stderr_sink(sink));
    client.start(&Context::background()).expect("start");
    assert!(eventually(Duration::from_secs(5), || text(&stderr).contains("serving")));
    client.kill(&Context::background());
}

#[test]
fn owned_reattach_outlives_the_first_client() {
    let first = Client::new(config("serve"));
    first.start(&Context::background()).expect("start");
    let pid = first.pid().expect("pid");
    let reattach = first
        .reattach_config()
        .expect("descriptor")
        .with_ownership(true);
    // A host that exits without killing leaves the plugin running.
    drop(first);
    assert!(alive(pid));

    let second = Client::new(ClientConfig::for_reattach(reattach).with_plugins(plugin_set()));
    let rpc = second.start(&Context::background()).expect("reattach");
    let stub: TestStub = rpc.dispense_as("test").expect("dispense");
    assert_eq!(stub.pid().expect("remote pid"), pid);

    second.kill(&Context::background());
    assert!(eventually(Duration::from_secs(5), || !alive(pid)));
}

// ---------------------------------------------------------------------------
// Misbehaving plugins
// ---------------------------------------------------------------------------

#[test]
fn silent_exit_is_reported_with_its_code() {
    let client = Client::new(config("silent-exit"));
    let error = client
        .start(&Context::background())
        .expect_err("no handshake");
    assert!(matches!(
        error,
        ClientError::Handshake(HandshakeError::ExitedBeforeHandshake { code: Some(3) })
    ));
    assert_eq!(client.state(), ClientState::Failed);
}

#[rstest]
#[case::core_version("bad-core-version")]
#[case::garbage("garbage")]
fn incompatible_plugins_are_killed(#[case] mode: &str) {
    let client = Client::new(config(mode));
    let error = client
        .start(&Context::background())
        .expect_err("incompatible");
    assert!(error.is_incompatible(), "unexpected error: {error}");
    assert!(client.exited());
}

#[test]
fn hanging_plugin_times_out() {
    let config = config("hang").with_timeouts(timeouts().with_startup(Duration::from_millis(500)));
    let client = Client::new(config);
    let started = Instant::now();
    let error = client.start(&Context::background()).expect_err("timeout");
    assert!(matches!(
        error,
        ClientError::Handshake(HandshakeError::Timeout { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ---------------------------------------------------------------------------
// Direct invocation
// ---------------------------------------------------------------------------

#[test]
fn running_the_binary_directly_is_refused() {
    let mut command = cargo_bin_cmd!("tether-test-plugin");
    command.env_remove(COOKIE_KEY).arg("serve");
    command
        .assert()
        .failure()
        .stderr(contains("not meant to be run directly"));
}

#[test]
fn unknown_mode_is_rejected() {
    let mut command = cargo_bin_cmd!("tether-test-plugin");
    command.env(COOKIE_KEY, COOKIE_VALUE).arg("juggle");
    command
        .assert()
        .code(2)
        .stderr(contains("unknown mode 'juggle'"));
}
