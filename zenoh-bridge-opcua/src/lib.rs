//! Zenoh bridge for OPC UA production lines.
//!
//! This bridge keeps a live view of the devices exposed by an OPC UA
//! endpoint, publishes their telemetry on a fixed cadence, publishes one
//! event per error bit that rises, and executes direct-method commands
//! received over Zenoh.
//!
//! # Key Expressions
//!
//! ```text
//! linebridge/opcua/<device>/telemetry   (published)
//! linebridge/opcua/<device>/error       (published)
//! linebridge/opcua/<device>/desired     (subscribed)
//! linebridge/opcua/@/commands           (queryable)
//! linebridge/opcua/@/status             (published)
//! ```
//!
//! Where `<device>` is the device's display name with spaces and
//! key-expression special characters replaced by `_`.

pub mod bridge;
pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
#[cfg(feature = "opcua")]
pub mod opcua_client;
pub mod record;
pub mod registry;
pub mod simulator;
pub mod task;
pub mod telemetry;

pub use bridge::{BuiltClient, LineBridge, build_client};
pub use connection::{ConnectionError, ConnectionState, DeviceConnection};
pub use dispatcher::{CommandDispatcher, CommandError, DeviceCommand};
pub use errors::{ErrorDiffLoop, ErrorState};
pub use record::DeviceRecord;
pub use registry::{DeviceRegistry, DiscoveryFilter};
pub use task::{CycleOutcome, LoopState};
pub use telemetry::TelemetryLoop;
