use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Open a Zenoh session using the provided configuration.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    config.validate()?;

    let mut zenoh_config = zenoh::Config::default();

    zenoh_config
        .insert_json5("mode", &format!("\"{}\"", config.mode))
        .map_err(|e| Error::Config(format!("Failed to set mode: {}", e)))?;

    for (path, endpoints) in [
        ("connect/endpoints", &config.connect),
        ("listen/endpoints", &config.listen),
    ] {
        if endpoints.is_empty() {
            continue;
        }

        let endpoints_json = serde_json::to_string(endpoints)?;
        zenoh_config
            .insert_json5(path, &endpoints_json)
            .map_err(|e| Error::Config(format!("Failed to set {}: {}", path, e)))?;
    }

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Connected to Zenoh");

    Ok(session)
}
