#![forbid(unsafe_code)]

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use nimbus_core::DriverError;
use nimbus_driver::{DriverGateway, Operation, RpcReply, RpcRequest};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};

fn temp_conf(target: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let path = std::env::temp_dir().join(format!("nimbus-rpc-{}.yaml", nanos));
    std::fs::write(&path, format!("target: \"{}\"\nconnect_timeout_secs: 2\ncall_timeout_secs: 5\n", target)).unwrap();
    path
}

/// Serves one request with `reply`, handing back the request it saw.
async fn serve_once(reply: impl Fn(&RpcRequest) -> RpcReply + Send + 'static) -> (String, JoinHandle<RpcRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(sock, LinesCodec::new());
        let line = framed.next().await.unwrap().unwrap();
        let req: RpcRequest = serde_json::from_str(&line).unwrap();
        let out = serde_json::to_string(&reply(&req)).unwrap();
        framed.send(out).await.unwrap();
        req
    });
    (addr, task)
}

#[tokio::test]
async fn payload_travels_as_json_string_and_result_is_decoded() {
    let (addr, server) = serve_once(|req| RpcReply {
        result: Some(json!({"IId": {"NameId": "sg", "SystemId": "sg-9"}, "echo": req.payload}).to_string()),
        error: None,
    })
    .await;
    let gw = DriverGateway::rpc(temp_conf(&addr));
    let v = gw.invoke(Operation::CreateSecurityGroup, "gcp-conn", json!({"Name": "sg"})).await.unwrap();
    assert_eq!(v["IId"]["SystemId"], "sg-9");

    let req = server.await.unwrap();
    assert_eq!(req.method, "CreateSecurity");
    let inner: Value = serde_json::from_str(&req.payload).unwrap();
    assert_eq!(inner, json!({"ConnectionName": "gcp-conn", "ReqInfo": {"Name": "sg"}}));
    assert_eq!(v["echo"], Value::String(req.payload));
}

#[tokio::test]
async fn remote_error_becomes_driver_error() {
    let (addr, server) =
        serve_once(|_| RpcReply { result: None, error: Some("vpc not found".into()) }).await;
    let gw = DriverGateway::rpc(temp_conf(&addr));
    let err = gw.invoke(Operation::AddSubnet { vpc: "v1".into() }, "c", json!({})).await.unwrap_err();
    assert_eq!(err, DriverError::Remote("vpc not found".into()));
    assert_eq!(server.await.unwrap().method, "AddSubnet");
}

#[tokio::test]
async fn monitoring_operations_are_unsupported_over_rpc() {
    let gw = DriverGateway::rpc(temp_conf("127.0.0.1:1"));
    let err = gw.invoke(Operation::CheckMonitoringEndpoint, "", Value::Null).await.unwrap_err();
    assert!(matches!(err, DriverError::Unsupported(_)));
}

#[tokio::test]
async fn missing_config_is_config_error() {
    let gw = DriverGateway::rpc("/nonexistent/nimbus/driver_rpc.yaml");
    let err = gw.invoke(Operation::ListVmSpecs, "c", Value::Null).await.unwrap_err();
    assert!(matches!(err, DriverError::Config(_)));
}

#[tokio::test]
async fn peer_hanging_up_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
    });
    let gw = DriverGateway::rpc(temp_conf(&addr));
    let err = gw.invoke(Operation::ListVmSpecs, "c", Value::Null).await.unwrap_err();
    assert!(matches!(err, DriverError::Transport(_)));
    server.await.unwrap();
}
