//! Linebridge Bridge Framework
//!
//! Plumbing shared by every Linebridge bridge binary.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`EventSink`] as the outbound boundary and [`Publisher`], its Zenoh implementation
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use linebridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
//!     let shutdown = runner.shutdown_token();
//!     runner.spawn(my_worker(runner.publisher(), shutdown));
//!
//!     // Run until Ctrl+C
//!     runner.run_with_metadata(None).await
//! }
//! ```

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::{EventSink, PublishStats, Publisher, encoding_for};
pub use runner::BridgeRunner;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from linebridge-common
pub use linebridge_common::{
    ErrorEvent, Format, KeyExprBuilder, LoggingConfig, TelemetryEvent, ZenohConfig,
};
