//! Linebridge Common Library
//!
//! Shared types and utilities for the Linebridge production-line bridge:
//!
//! - [`events`] - Outbound telemetry/error events and inbound command messages
//! - [`serialization`] - JSON/CBOR encoding and decoding
//! - [`config`] - Zenoh and logging configuration (JSON5 format)
//! - [`session`] - Zenoh session management
//! - [`keyexpr`] - Key expression builders and parsers
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod events;
pub mod keyexpr;
pub mod serialization;
pub mod session;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use events::{
    CommandRequest, CommandResponse, DesiredProperties, ErrorEvent, TelemetryEvent,
    current_timestamp_millis,
};
pub use keyexpr::{DEFAULT_KEY_PREFIX, KeyExprBuilder, device_segment};
pub use serialization::{Format, decode, decode_auto, encode};
pub use session::connect;

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Example
///
/// ```ignore
/// use linebridge_common::{LoggingConfig, LogFormat, init_tracing};
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     format: LogFormat::Json,
/// };
/// init_tracing(&config)?;
/// ```
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let outcome = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    outcome.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
