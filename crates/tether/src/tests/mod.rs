//! Crate-level integration and BDD tests.
#![cfg(unix)]

use crate::client::{Client, ClientConfig, ClientState};
use crate::context::Context;
use crate::reattach::ReattachConfig;
use crate::test_support::{Doubler, InProcessServer, doubler_set};

mod behaviour;

#[test]
fn descriptor_survives_a_json_round_trip_and_reattaches() {
    let server = InProcessServer::start();
    let first = Client::new(server.config());
    first.start(&Context::background()).expect("start");

    let json = serde_json::to_string(&first.reattach_config().expect("descriptor"))
        .expect("serialise descriptor");
    let restored: ReattachConfig = serde_json::from_str(&json).expect("parse descriptor");
    let second = Client::new(ClientConfig::for_reattach(restored).with_plugins(doubler_set()));
    let rpc = second.start(&Context::background()).expect("reattach");
    let doubler: Doubler = rpc.dispense_as("test").expect("dispense");
    assert_eq!(doubler.double(-4).expect("double"), -8);

    second.kill(&Context::background());
    assert_eq!(second.state(), ClientState::Killed);
    assert!(!first.exited(), "non-owning kill must leave the plugin running");
    first.kill(&Context::background());
}
