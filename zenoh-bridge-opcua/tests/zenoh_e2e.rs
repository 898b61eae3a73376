//! End-to-end tests over a real Zenoh session.
//!
//! Note: Zenoh requires multi-thread tokio runtime.
//! Each test uses a unique key prefix to avoid interference.

use std::sync::Arc;
use std::time::Duration;

use linebridge_common::{CommandResponse, Format, KeyExprBuilder, TelemetryEvent, decode_auto};
use linebridge_framework::Publisher;
use tokio_util::sync::CancellationToken;
use zenoh::bytes::Encoding;

use zenoh_bridge_opcua::LineBridge;
use zenoh_bridge_opcua::commands::CommandServer;
use zenoh_bridge_opcua::config::OpcuaConfig;
use zenoh_bridge_opcua::simulator::{SimulatedClient, SimulatedDevice};

/// Generate a unique test prefix to avoid test interference.
fn unique_prefix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test_{}/opcua", nanos)
}

fn config(prefix: &str) -> OpcuaConfig {
    json5::from_str(&format!(
        r#"{{ endpoint: "sim://line", key_prefix: "{}" }}"#,
        prefix
    ))
    .unwrap()
}

async fn open_session() -> Arc<zenoh::Session> {
    let session = zenoh::open(zenoh::Config::default())
        .await
        .expect("Failed to open Zenoh session");
    Arc::new(session)
}

async fn query(session: &zenoh::Session, key: &str, payload: &[u8]) -> CommandResponse {
    let replies = session
        .get(key)
        .payload(payload.to_vec())
        .await
        .expect("Failed to send query");

    let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv_async())
        .await
        .expect("Timeout waiting for reply")
        .expect("Failed to receive reply");

    let sample = reply.result().expect("Error reply");
    assert_eq!(sample.encoding(), &Encoding::APPLICATION_JSON);
    let payload = sample.payload().to_bytes();
    serde_json::from_slice(&payload).expect("Failed to decode response")
}

/// Commands sent as Zenoh queries reach the device and get a status reply.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_query_roundtrip() {
    let prefix = unique_prefix();
    let session = open_session().await;

    let sim = Arc::new(SimulatedClient::with_devices(
        2,
        [SimulatedDevice::new("Device 1")],
    ));
    let publisher = Arc::new(Publisher::new(session.clone(), &prefix, Format::Json));
    let bridge = LineBridge::new(&config(&prefix), sim.clone(), publisher);

    let keys = KeyExprBuilder::new(&prefix);
    let shutdown = CancellationToken::new();
    let server = CommandServer::new(session.clone(), keys.clone(), bridge.dispatcher.clone());
    let handle = tokio::spawn(server.run(shutdown.clone()));

    // Give the queryable time to set up
    tokio::time::sleep(Duration::from_millis(200)).await;

    let ok = query(
        &session,
        &keys.command_key(),
        br#"{"device": "Device 1", "command": "EmergencyStop"}"#,
    )
    .await;
    assert_eq!(ok.status, 200);
    assert_eq!(sim.device("Device 1").unwrap().production_status, 0);

    let unknown = query(
        &session,
        &keys.command_key(),
        br#"{"device": "Device 1", "command": "Jump"}"#,
    )
    .await;
    assert_eq!(unknown.status, 404);

    let malformed = query(&session, &keys.command_key(), b"garbage").await;
    assert_eq!(malformed.status, 400);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    session.close().await.unwrap();
}

/// A telemetry cycle puts one JSON event per device on its telemetry key.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_telemetry_published_to_zenoh() {
    let prefix = unique_prefix();
    let session = open_session().await;

    let subscriber = session
        .declare_subscriber(format!("{}/**", prefix))
        .await
        .expect("Failed to create subscriber");

    // Give subscriber time to set up
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sim = Arc::new(SimulatedClient::with_devices(
        2,
        [SimulatedDevice::new("Device 1")],
    ));
    let publisher = Arc::new(Publisher::new(session.clone(), &prefix, Format::Json));
    let bridge = LineBridge::new(&config(&prefix), sim, publisher);

    bridge
        .telemetry
        .run_cycle(&CancellationToken::new())
        .await;

    let received = tokio::time::timeout(Duration::from_secs(5), subscriber.recv_async())
        .await
        .expect("Timeout waiting for telemetry")
        .expect("Failed to receive telemetry");

    assert_eq!(
        received.key_expr().as_str(),
        format!("{}/Device_1/telemetry", prefix)
    );

    assert_eq!(received.encoding(), &Encoding::APPLICATION_JSON);

    let payload = received.payload().to_bytes();
    let event: TelemetryEvent = decode_auto(&payload).expect("Failed to decode");
    assert_eq!(event.device_name, "Device 1");
    assert_eq!(event.production_status, "1");

    session.close().await.unwrap();
}

/// CBOR payloads are announced as CBOR so subscribers can pick a decoder.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cbor_telemetry_carries_encoding() {
    let prefix = unique_prefix();
    let session = open_session().await;

    let subscriber = session
        .declare_subscriber(format!("{}/*/telemetry", prefix))
        .await
        .expect("Failed to create subscriber");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let sim = Arc::new(SimulatedClient::with_devices(
        2,
        [SimulatedDevice::new("Device 1")],
    ));
    let publisher = Arc::new(Publisher::new(session.clone(), &prefix, Format::Cbor));
    let bridge = LineBridge::new(&config(&prefix), sim, publisher);

    bridge
        .telemetry
        .run_cycle(&CancellationToken::new())
        .await;

    let received = tokio::time::timeout(Duration::from_secs(5), subscriber.recv_async())
        .await
        .expect("Timeout waiting for telemetry")
        .expect("Failed to receive telemetry");

    assert_eq!(received.encoding(), &Encoding::APPLICATION_CBOR);
    let event: TelemetryEvent =
        decode_auto(&received.payload().to_bytes()).expect("Failed to decode");
    assert_eq!(event.device_name, "Device 1");

    session.close().await.unwrap();
}
