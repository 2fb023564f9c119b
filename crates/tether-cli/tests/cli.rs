//! Integration tests for the `tether` binary.
//!
//! A JSON-lines RPC server runs inside the test process; the "plugin" is a
//! shell script that announces that server and then sleeps, which gives the
//! CLI a real process to supervise.
#![cfg(unix)]

use std::fs;
use std::process::Command;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tether::transport::{ListenerOptions, PluginListener};
use tether::{ExitSignal, ProtocolKind, ReattachConfig, RpcServer, SocketEndpoint};

struct Harness {
    dir: TempDir,
    endpoint: SocketEndpoint,
    shutdown: ExitSignal,
    server: Option<JoinHandle<()>>,
}

impl Harness {
    fn path(&self, name: &str) -> String {
        self.dir
            .path()
            .join(name)
            .to_str()
            .expect("utf-8 path")
            .to_owned()
    }

    fn descriptor(&self) -> String {
        self.path("plugin.json")
    }

    fn script(&self) -> String {
        format!(
            "echo '1|1|tcp|{}|rpc'; exec sleep 30",
            self.endpoint.wire_address()
        )
    }

    /// Keeps writing to both output streams long after the handshake.
    fn chatty_script(&self) -> String {
        format!(
            "echo '1|1|tcp|{}|rpc'; sleep 1; \
             while true; do echo tick >&2; echo tock; sleep 0.1; done",
            self.endpoint.wire_address()
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.fire();
        if let Some(server) = self.server.take() {
            server.join().expect("server thread");
        }
    }
}

#[fixture]
fn harness() -> Harness {
    let listener = PluginListener::bind(&ListenerOptions::tcp()).expect("bind");
    let endpoint = listener.endpoint().clone();
    let shutdown = ExitSignal::new();
    let stop = shutdown.clone();
    let server = thread::spawn(move || RpcServer::new().serve(&listener, &stop));
    Harness {
        dir: TempDir::new().expect("temp dir"),
        endpoint,
        shutdown,
        server: Some(server),
    }
}

#[rstest]
fn detached_launch_can_be_probed_and_stopped(harness: Harness) {
    let descriptor = harness.descriptor();
    let mut launch = cargo_bin_cmd!("tether");
    launch
        .args(["launch", "--detach", "--output", descriptor.as_str(), "--"])
        .args(["sh", "-c", harness.script().as_str()]);
    launch.assert().success();

    let written = fs::read_to_string(&descriptor).expect("descriptor written");
    let parsed: ReattachConfig = serde_json::from_str(&written).expect("descriptor parses");
    assert!(parsed.owned());
    assert_eq!(parsed.endpoint(), &harness.endpoint);

    let mut probe = cargo_bin_cmd!("tether");
    probe.args(["probe", descriptor.as_str()]);
    probe.assert().success().stdout(contains("is alive"));

    let mut stop = cargo_bin_cmd!("tether");
    stop.args(["stop", descriptor.as_str()]);
    stop.assert()
        .success()
        .stdout(contains(format!("stopped plugin {}", parsed.pid())));
}

#[rstest]
#[case::relayed(false)]
#[case::logged(true)]
fn detached_plugin_keeps_writing_after_launch_exits(harness: Harness, #[case] logged: bool) {
    let descriptor = harness.descriptor();
    let log = harness.path("plugin.log");
    let mut launch = cargo_bin_cmd!("tether");
    launch.args(["launch", "--detach", "--output", descriptor.as_str()]);
    if logged {
        launch.args(["--plugin-log", log.as_str()]);
    }
    launch
        .arg("--")
        .args(["sh", "-c", harness.chatty_script().as_str()]);
    launch.assert().success();

    thread::sleep(Duration::from_secs(3));
    let mut check = cargo_bin_cmd!("tether");
    check.args(["probe", descriptor.as_str()]);
    check.assert().success().stdout(contains("is alive"));
    if logged {
        let written = fs::read_to_string(&log).expect("plugin log");
        assert!(written.contains("tick"), "stderr should reach the log: {written:?}");
    }

    let mut stop = cargo_bin_cmd!("tether");
    stop.args(["stop", descriptor.as_str()]);
    stop.assert().success();
}

#[rstest]
fn probing_a_dead_plugin_fails(harness: Harness) {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap true");
    let descriptor = ReattachConfig::new(pid, harness.endpoint.clone(), ProtocolKind::NetRpc, 1);
    let path = harness.descriptor();
    fs::write(&path, serde_json::to_string(&descriptor).expect("serialise"))
        .expect("write descriptor");

    let mut probe = cargo_bin_cmd!("tether");
    probe.args(["probe", path.as_str()]);
    probe
        .assert()
        .code(1)
        .stdout(contains(format!("plugin {pid} is not running")));
}

#[test]
fn plugin_exiting_before_handshake_fails_launch() {
    let mut launch = cargo_bin_cmd!("tether");
    launch.args(["launch", "--", "sh", "-c", "exit 4"]);
    launch
        .assert()
        .failure()
        .stderr(contains("exited before completing the handshake"));
}

#[test]
fn launch_without_a_program_is_a_usage_error() {
    let mut launch = cargo_bin_cmd!("tether");
    launch.arg("launch");
    launch.assert().code(2);
}
