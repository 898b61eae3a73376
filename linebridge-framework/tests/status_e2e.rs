//! Status announcements over a real Zenoh session.
//!
//! Note: Zenoh requires multi-thread tokio runtime.
//! Each test uses a unique key prefix to avoid interference.

use std::sync::Arc;
use std::time::Duration;

use linebridge_framework::{BridgeStatus, Format, Publisher, StatusPublisher};
use zenoh::bytes::Encoding;

/// Generate a unique test prefix to avoid test interference.
fn unique_prefix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test_{}/opcua", nanos)
}

async fn next_status(
    subscriber: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
) -> BridgeStatus {
    let sample = tokio::time::timeout(Duration::from_secs(5), subscriber.recv_async())
        .await
        .expect("Timeout waiting for status")
        .expect("Failed to receive status");
    assert_eq!(sample.encoding(), &Encoding::APPLICATION_JSON);
    serde_json::from_slice(&sample.payload().to_bytes()).expect("Failed to decode status")
}

/// A worker failure reported before startup keeps the bridge in "error".
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_outlives_running_announcement() {
    let prefix = unique_prefix();
    let session = Arc::new(
        zenoh::open(zenoh::Config::default())
            .await
            .expect("Failed to open Zenoh session"),
    );

    let subscriber = session
        .declare_subscriber(format!("{}/@/status", prefix))
        .await
        .expect("Failed to create subscriber");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // CBOR events still get JSON status
    let publisher = Publisher::new(session.clone(), &prefix, Format::Cbor);
    let status = StatusPublisher::new(publisher, "opcua", "0.1.0");

    status
        .publish_error("commands: queryable declaration failed")
        .await
        .expect("Failed to publish error status");
    status
        .publish_running(Some(serde_json::json!({ "endpoint": "sim://line" })))
        .await
        .expect("Failed to publish running status");

    let first = next_status(&subscriber).await;
    assert_eq!(first.status, "error");
    assert_eq!(first.metadata["error"], "commands: queryable declaration failed");

    let second = next_status(&subscriber).await;
    assert_eq!(second.status, "error");
    assert_eq!(
        status.failure().await.as_deref(),
        Some("commands: queryable declaration failed")
    );

    status.publish_offline().await.expect("Failed to publish offline status");
    assert_eq!(next_status(&subscriber).await.status, "offline");

    session.close().await.unwrap();
}
