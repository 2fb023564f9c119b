//! Unit tests for the JSONL RPC layer.

use std::any::Any;
use std::io::Cursor;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::{Value, json};

use super::*;
use crate::context::Context;
use crate::negotiator::{DialPolicy, dial};
use crate::signal::ExitSignal;
use crate::transport::{Connection, ListenerOptions, PluginListener};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Echo;

impl Service for Echo {
    fn call(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        match method {
            "echo" => Ok(params),
            "fail" => Err(RpcFault::new(RpcFault::INTERNAL, "asked to fail")),
            other => Err(RpcFault::unknown_method("echo", other)),
        }
    }
}

#[derive(Debug)]
struct EchoStub {
    caller: RpcCaller,
}

impl EchoStub {
    fn echo(&self, value: &Value) -> Result<Value, RpcError> {
        self.caller.call_as("echo", value)
    }
}

struct EchoPlugin;

impl Plugin for EchoPlugin {
    fn client(&self, caller: RpcCaller) -> Box<dyn Any + Send> {
        Box::new(EchoStub { caller })
    }
}

struct Harness {
    client: Arc<RpcClient>,
    shutdown: ExitSignal,
    server: Option<JoinHandle<()>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.client.close();
        self.shutdown.fire();
        if let Some(server) = self.server.take() {
            server.join().expect("server thread");
        }
    }
}

#[fixture]
fn harness() -> Harness {
    let listener = PluginListener::bind(&ListenerOptions::tcp()).expect("bind listener");
    let endpoint = listener.endpoint().clone();
    let shutdown = ExitSignal::new();
    let server = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            RpcServer::new()
                .register("echo", Echo)
                .serve(&listener, &shutdown);
        })
    };
    let connection = dial(&endpoint, None, &DialPolicy::default(), &Context::background())
        .expect("dial server");
    let plugins = PluginSet::new().with("echo", EchoPlugin);
    Harness {
        client: RpcClient::new(connection, plugins),
        shutdown,
        server: Some(server),
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[rstest]
fn call_round_trips_parameters(harness: Harness) {
    let result = harness
        .client
        .call("echo", "echo", json!({"n": 21}))
        .expect("echo call");
    assert_eq!(result, json!({"n": 21}));
}

#[rstest]
fn remote_faults_keep_the_connection_usable(harness: Harness) {
    let error = harness
        .client
        .call("echo", "fail", Value::Null)
        .expect_err("service fails");
    let RpcError::Remote(fault) = error else {
        panic!("expected remote fault, got {error:?}");
    };
    assert_eq!(fault.code(), RpcFault::INTERNAL);
    assert!(!harness.client.is_closed());
    harness.client.ping().expect("ping after fault");
}

#[rstest]
fn unknown_service_is_reported(harness: Harness) {
    let error = harness
        .client
        .call("nope", "x", Value::Null)
        .expect_err("unknown service");
    assert!(matches!(error, RpcError::Remote(ref fault) if fault.code() == RpcFault::UNKNOWN_SERVICE));
}

#[rstest]
fn quit_fires_the_shutdown_signal(harness: Harness) {
    harness
        .client
        .quit(Duration::from_secs(5))
        .expect("quit acknowledged");
    assert!(harness.shutdown.wait_timeout(Duration::from_secs(5)));
}

#[rstest]
fn closed_client_rejects_calls(harness: Harness) {
    harness.client.close();
    harness.client.close();
    assert!(matches!(harness.client.ping(), Err(RpcError::Closed)));
    assert!(matches!(
        harness.client.dispense("echo"),
        Err(RpcError::Closed)
    ));
}

#[test]
fn close_interrupts_a_call_in_flight() {
    // The connection lands in the listener's backlog and is never answered.
    let mute = TcpListener::bind("127.0.0.1:0").expect("bind mute listener");
    let stream = TcpStream::connect(mute.local_addr().expect("mute address")).expect("connect");
    let client = RpcClient::new(Connection::Tcp(stream), PluginSet::new());
    let caller = Arc::clone(&client);
    let call = thread::spawn(move || caller.ping());
    thread::sleep(Duration::from_millis(200));

    assert!(matches!(
        client.quit(Duration::from_secs(5)),
        Err(RpcError::Busy)
    ));
    client.close();
    assert!(client.is_closed());
    assert!(call.join().expect("call thread").is_err());
    assert!(matches!(client.ping(), Err(RpcError::Closed)));
}

// ---------------------------------------------------------------------------
// Dispensing
// ---------------------------------------------------------------------------

#[rstest]
fn dispensed_stub_calls_its_service(harness: Harness) {
    let stub: EchoStub = harness.client.dispense_as("echo").expect("dispense echo");
    assert_eq!(stub.caller.service(), "echo");
    assert_eq!(stub.echo(&json!([1, 2])).expect("echo"), json!([1, 2]));
}

#[rstest]
fn unknown_plugin_lists_available_names(harness: Harness) {
    let error = harness
        .client
        .dispense("missing")
        .err()
        .expect("unknown plugin");
    let RpcError::UnknownPlugin { name, available } = error else {
        panic!("expected unknown plugin, got {error:?}");
    };
    assert_eq!(name, "missing");
    assert_eq!(available, vec!["echo".to_owned()]);
}

#[rstest]
fn wrong_stub_type_is_reported(harness: Harness) {
    let error = harness
        .client
        .dispense_as::<String>("echo")
        .expect_err("stub is not a String");
    assert!(matches!(error, RpcError::StubType { .. }));
}

#[test]
fn control_service_cannot_be_replaced() {
    let server = RpcServer::new().register(CONTROL_SERVICE, Echo);
    assert!(server.service_names().is_empty());
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[test]
fn response_without_result_is_null() {
    let response: RpcResponse = serde_json::from_str(r#"{"id":3}"#).expect("decode");
    assert_eq!(response.into_result(), Ok(Value::Null));
}

#[test]
fn read_frame_reports_end_of_stream() {
    let mut empty = Cursor::new(Vec::new());
    let frame: Option<RpcRequest> = read_frame(&mut empty).expect("read");
    assert!(frame.is_none());
}

#[test]
fn write_then_read_frame_preserves_request() {
    let request = RpcRequest::new(9, "svc", "m", json!({"k": true}));
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &request).expect("write");
    assert_eq!(buffer.last(), Some(&b'\n'));
    let decoded: Option<RpcRequest> = read_frame(&mut Cursor::new(buffer)).expect("read");
    assert_eq!(decoded, Some(request));
}
