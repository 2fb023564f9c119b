//! Behaviour-driven tests for the client lifecycle.

use std::process::Command;
use std::sync::Arc;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tether_config::SocketEndpoint;

use crate::client::{Client, ClientConfig, PluginCommand};
use crate::context::Context;
use crate::error::ClientError;
use crate::handshake::ProtocolKind;
use crate::reattach::ReattachConfig;
use crate::rpc::RpcClient;
use crate::supervisor::{LivenessProbe, SignalProbe};
use crate::test_support::{Doubler, InProcessServer, doubler_set, quick_timeouts};

// ---------------------------------------------------------------------------
// Test world
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestWorld {
    server: Option<InProcessServer>,
    config: Option<ClientConfig>,
    client: Option<Client>,
    outcome: Option<Result<Arc<RpcClient>, ClientError>>,
    second: Option<Client>,
    second_rpc: Option<Arc<RpcClient>>,
    pid: Option<u32>,
}

impl Drop for TestWorld {
    fn drop(&mut self) {
        for client in [self.second.take(), self.client.take()].into_iter().flatten() {
            client.kill(&Context::background());
        }
    }
}

#[fixture]
fn world() -> TestWorld {
    TestWorld::default()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn client(world: &TestWorld) -> &Client {
    world.client.as_ref().expect("client was not started")
}

fn rpc(world: &TestWorld) -> &Arc<RpcClient> {
    world
        .outcome
        .as_ref()
        .expect("no start outcome captured")
        .as_ref()
        .expect("expected start to succeed")
}

fn start_error(world: &TestWorld) -> &ClientError {
    world
        .outcome
        .as_ref()
        .expect("no start outcome captured")
        .as_ref()
        .expect_err("expected start to fail")
}

fn double(rpc: &Arc<RpcClient>, capability: &str, input: i64) -> i64 {
    let doubler: Doubler = rpc
        .dispense_as(capability.trim_matches('"'))
        .expect("dispense capability");
    doubler.double(input).expect("call double")
}

// ---------------------------------------------------------------------------
// Given steps
// ---------------------------------------------------------------------------

#[given("a plugin that announces the in-process server")]
fn given_well_behaved_plugin(world: &mut TestWorld) {
    let server = InProcessServer::start();
    world.config = Some(server.config());
    world.server = Some(server);
}

#[given("a plugin that exits with code {code} before its handshake")]
fn given_silent_plugin(world: &mut TestWorld, code: i32) {
    let command = PluginCommand::new("sh").arg("-c").arg(format!("exit {code}"));
    world.config = Some(
        ClientConfig::for_command(command)
            .with_plugins(doubler_set())
            .with_timeouts(quick_timeouts()),
    );
}

#[given("a plugin whose handshake is {line}")]
fn given_announcing_plugin(world: &mut TestWorld, line: String) {
    let command = InProcessServer::plugin(line.trim_matches('"'), "");
    world.config = Some(
        ClientConfig::for_command(command)
            .with_plugins(doubler_set())
            .with_timeouts(quick_timeouts()),
    );
}

#[given("a reattach descriptor for a process that is not running")]
fn given_dead_descriptor(world: &mut TestWorld) {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap true");
    let reattach = ReattachConfig::new(
        pid,
        SocketEndpoint::tcp("127.0.0.1", 1),
        ProtocolKind::NetRpc,
        1,
    );
    world.config = Some(
        ClientConfig::for_reattach(reattach)
            .with_plugins(doubler_set())
            .with_timeouts(quick_timeouts()),
    );
}

// ---------------------------------------------------------------------------
// When steps
// ---------------------------------------------------------------------------

#[when("the client is started")]
fn when_started(world: &mut TestWorld) {
    let config = world.config.take().expect("no plugin configured");
    let started = Client::new(config);
    world.outcome = Some(started.start(&Context::background()));
    world.pid = started.pid();
    world.client = Some(started);
}

#[when("the client is killed")]
fn when_killed(world: &mut TestWorld) {
    client(world).kill(&Context::background());
}

#[when("a second client reattaches using the first client's descriptor")]
fn when_second_reattaches(world: &mut TestWorld) {
    let reattach = client(world).reattach_config().expect("descriptor");
    let second = Client::new(ClientConfig::for_reattach(reattach).with_plugins(doubler_set()));
    world.second_rpc = Some(second.start(&Context::background()).expect("reattach"));
    world.second = Some(second);
}

// ---------------------------------------------------------------------------
// Then steps
// ---------------------------------------------------------------------------

#[then("the client is connected")]
fn then_connected(world: &mut TestWorld) {
    assert!(rpc(world).ping().is_ok(), "plugin should answer ping");
    assert_eq!(client(world).state().to_string(), "connected");
}

#[then("the client is in state {state}")]
fn then_state(world: &mut TestWorld, state: String) {
    assert_eq!(client(world).state().to_string(), state.trim_matches('"'));
    assert!(client(world).exited());
}

#[then("the {capability} capability doubles {input} to {output}")]
fn then_doubles(world: &mut TestWorld, capability: String, input: i64, output: i64) {
    assert_eq!(double(rpc(world), &capability, input), output);
}

#[then("the plugin process is no longer running")]
fn then_process_gone(world: &mut TestWorld) {
    let pid = world.pid.expect("no pid captured");
    assert!(!SignalProbe.is_alive(pid).expect("probe pid"));
}

#[then("starting fails because the plugin is unreachable")]
fn then_unreachable(world: &mut TestWorld) {
    let error = start_error(world);
    assert!(error.is_unreachable(), "expected unreachable, got: {error}");
}

#[then("starting fails because the plugin is incompatible")]
fn then_incompatible(world: &mut TestWorld) {
    let error = start_error(world);
    assert!(error.is_incompatible(), "expected incompatible, got: {error}");
}

#[then("the second client is connected")]
fn then_second_connected(world: &mut TestWorld) {
    let second = world.second.as_ref().expect("second client");
    assert_eq!(second.state().to_string(), "connected");
    assert_eq!(second.pid(), client(world).pid());
}

#[then("calling {capability} through the second client doubles {input} to {output}")]
fn then_second_doubles(world: &mut TestWorld, capability: String, input: i64, output: i64) {
    let second = world.second_rpc.as_ref().expect("second rpc");
    assert_eq!(double(second, &capability, input), output);
}

// ---------------------------------------------------------------------------
// Scenario registration
// ---------------------------------------------------------------------------

#[scenario(path = "tests/features/client_lifecycle.feature")]
fn client_lifecycle_behaviour(world: TestWorld) {
    let _ = world;
}
