//! Transport tests across real socket files
//!
//! - Request/response correlation with params and body
//! - Fail-fast against absent peers
//! - Void event delivery
//! - Heartbeat recovery of the local endpoint

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use bridgehub_core::transport::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatTask, IpcClient, IpcServer, Params,
    TransportConfig, VoidEvent,
};

fn server(dir: &TempDir, identity: &str) -> IpcServer {
    let config = TransportConfig::new(dir.path());
    IpcServer::new(identity, config.namespace.endpoint(identity))
}

#[tokio::test]
async fn test_fetch_round_trip() {
    let dir = TempDir::new().unwrap();
    let bridge = server(&dir, "den");
    bridge.route("echo", |params: Params, body: Value| async move {
        json!({ "params": params, "body": body })
    });
    bridge.listen().await.unwrap();

    let client = IpcClient::new(TransportConfig::new(dir.path()));
    let params = Params::from([("uuid".to_string(), "abc".to_string())]);
    let reply = client
        .fetch("den", "echo", Some(params), Some(json!({ "on": true })))
        .await
        .unwrap();

    assert_eq!(
        reply,
        json!({ "params": { "uuid": "abc" }, "body": { "on": true } })
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_fetches_are_correlated() {
    let dir = TempDir::new().unwrap();
    let bridge = server(&dir, "den");
    bridge.route("slow-echo", |params: Params, _body: Value| async move {
        let n: u64 = params.get("n").and_then(|n| n.parse().ok()).unwrap_or(0);
        // Later requests answer first.
        tokio::time::sleep(Duration::from_millis(50 - n * 10)).await;
        json!(n)
    });
    bridge.listen().await.unwrap();

    let client = Arc::new(IpcClient::new(TransportConfig::new(dir.path())));
    let calls = (0..5u64).map(|n| {
        let client = Arc::clone(&client);
        async move {
            let params = Params::from([("n".to_string(), n.to_string())]);
            client.fetch("den", "slow-echo", Some(params), None).await
        }
    });
    let replies = futures::future::join_all(calls).await;

    let expected: Vec<Option<Value>> = (0..5u64).map(|n| Some(json!(n))).collect();
    assert_eq!(replies, expected);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_fetch_to_absent_peer_fails_fast() {
    let dir = TempDir::new().unwrap();
    let client = IpcClient::new(TransportConfig::new(dir.path()));

    let started = Instant::now();
    assert_eq!(client.fetch("ghost", "status:get", None, None).await, None);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(client.connected_peers().is_empty());
}

#[tokio::test]
async fn test_unknown_path_replies_null() {
    let dir = TempDir::new().unwrap();
    let bridge = server(&dir, "den");
    bridge.listen().await.unwrap();

    let client = IpcClient::new(TransportConfig::new(dir.path()));
    assert_eq!(
        client.fetch("den", "plugins:install", None, None).await,
        Some(Value::Null)
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_void_event_delivered_without_reply() {
    let dir = TempDir::new().unwrap();
    let hub = server(&dir, "hub");
    let mut events = hub.subscribe();
    hub.listen().await.unwrap();

    let client = IpcClient::new(TransportConfig::new(dir.path()));
    client
        .emit("hub", VoidEvent::Log, json!({ "message": "hello" }))
        .await;

    let inbound = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.event, VoidEvent::Log);
    assert_eq!(inbound.data["message"], json!("hello"));
    hub.shutdown().await;
}

#[tokio::test]
async fn test_fetch_after_peer_restart() {
    let dir = TempDir::new().unwrap();
    let bridge = server(&dir, "den");
    bridge.route("status:get", |_: Params, _: Value| async { json!("up") });
    bridge.listen().await.unwrap();

    let client = IpcClient::new(TransportConfig::new(dir.path()));
    assert_eq!(client.fetch("den", "status:get", None, None).await, Some(json!("up")));

    bridge.restart().await.unwrap();
    client.disconnect("den");
    assert_eq!(client.fetch("den", "status:get", None, None).await, Some(json!("up")));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_against_live_and_dead_peer() {
    let dir = TempDir::new().unwrap();
    let hub = server(&dir, "hub");
    hub.listen().await.unwrap();

    let bridge = Arc::new(server(&dir, "den"));
    bridge.listen().await.unwrap();
    let client = Arc::new(IpcClient::new(TransportConfig::new(dir.path())));

    let mut heartbeat = HeartbeatTask::new(
        HeartbeatConfig::new("hub", Duration::from_millis(200)),
        Arc::clone(&client),
        Arc::clone(&bridge),
    );
    assert_eq!(
        heartbeat.tick().await,
        HeartbeatEvent::Healthy {
            peer: "hub".to_string()
        }
    );

    hub.shutdown().await;
    assert_eq!(
        heartbeat.tick().await,
        HeartbeatEvent::PeerUnresponsive {
            peer: "hub".to_string(),
            missed: 1,
            relistened: true,
        }
    );
    assert!(bridge.is_listening().await);
    bridge.shutdown().await;
}
