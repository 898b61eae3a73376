//! Zenoh bridge for OPC UA production lines.
//!
//! Polls the devices of one OPC UA endpoint, publishes telemetry and
//! rising-edge error events to Zenoh and serves direct-method commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use linebridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner, EventSink, KeyExprBuilder};

use zenoh_bridge_opcua::commands::CommandServer;
use zenoh_bridge_opcua::config::OpcuaBridgeConfig;
use zenoh_bridge_opcua::{LineBridge, build_client};

/// Production tick of the in-process simulator.
const SIMULATOR_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = BridgeArgs::parse_with_default("opcua.json5");

    // Load configuration using the framework's BridgeConfig trait
    let config = OpcuaBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;

    // Create the bridge runner
    let runner = BridgeRunner::new_with_args("opcua", config, Some(&args))
        .await
        .context("Failed to start bridge runner")?;
    let mut runner = runner.with_status_publishing();

    let opcua = runner.config().opcua.clone();
    let shutdown = runner.shutdown_token();
    let sink: Arc<dyn EventSink> = Arc::new(runner.publisher());

    let built = build_client(&opcua).context("Failed to build device client")?;
    let bridge = Arc::new(LineBridge::new(&opcua, built.client, sink));

    // A failed first connect is not fatal; the loops keep retrying.
    if !bridge.connection.ensure_connected().await {
        tracing::warn!(endpoint = %opcua.endpoint, "Device endpoint not reachable yet");
    }

    tracing::info!(
        endpoint = %opcua.endpoint,
        prefix = %opcua.key_prefix,
        telemetry_interval_secs = opcua.telemetry_interval_secs,
        error_poll_interval_ms = opcua.error_poll_interval_ms,
        "OPC UA bridge starting"
    );

    // Polling loops run until shutdown, then release the device connection
    bridge.start(&shutdown);
    runner.spawn({
        let bridge = bridge.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            bridge.stop().await;
        }
    });

    // Command and desired-property transport
    let server = CommandServer::new(
        runner.session().clone(),
        KeyExprBuilder::new(opcua.key_prefix.clone()),
        bridge.dispatcher.clone(),
    );
    runner.spawn_with_error("commands".to_string(), server.run(shutdown.clone()));

    if let Some(sim) = built.simulator {
        tracing::info!("Using simulated OPC UA endpoint");
        let shutdown = shutdown.clone();
        runner.spawn(async move {
            let mut ticker = tokio::time::interval(SIMULATOR_TICK);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => sim.advance(),
                }
            }
        });
    }

    // Build status metadata
    let metadata = serde_json::json!({
        "endpoint": opcua.endpoint,
        "client": opcua.client.kind(),
        "namespace_index": opcua.namespace_index,
        "device_prefix": opcua.device_prefix,
        "telemetry_interval_secs": opcua.telemetry_interval_secs,
        "error_poll_interval_ms": opcua.error_poll_interval_ms,
        "reconnect_policy": opcua.reconnect_policy,
        "format": runner.config().format(),
    });

    // Run until Ctrl+C (handles shutdown gracefully)
    runner
        .run_with_metadata(Some(metadata))
        .await
        .context("Bridge terminated with an error")
}
