//! Inbound command handling.
//!
//! Requests are checked in a fixed order: a missing device or command name
//! is a 400, a command outside the vocabulary a 404, and anything that goes
//! wrong after that (no connection, unknown device, device-side rejection)
//! a 500.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use linebridge_common::{CommandRequest, CommandResponse};
use tracing::{info, warn};

use crate::connection::DeviceConnection;
use crate::record::{
    DeviceRecord, MAX_PRODUCTION_RATE, MIN_PRODUCTION_RATE, PRODUCTION_RATE_STEP, field,
    is_valid_production_rate,
};
use crate::registry::DeviceRegistry;

/// The closed set of direct-method commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    EmergencyStop,
    ResetErrorStatus,
    DecreaseProductionRate,
}

impl DeviceCommand {
    pub const ALL: [DeviceCommand; 3] = [
        DeviceCommand::EmergencyStop,
        DeviceCommand::ResetErrorStatus,
        DeviceCommand::DecreaseProductionRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::EmergencyStop => "EmergencyStop",
            DeviceCommand::ResetErrorStatus => "ResetErrorStatus",
            DeviceCommand::DecreaseProductionRate => "DecreaseProductionRate",
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceCommand {
    type Err = CommandError;

    /// Exact, case-sensitive match.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CommandError::UnknownCommand(s.to_string()))
    }
}

/// Why a command or desired-property update was not carried out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Device name and command name are required")]
    Malformed,
    #[error("Invalid production rate {0}: expected 0-100 in steps of 10")]
    InvalidRate(i64),
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),
    #[error("Not connected to the device endpoint")]
    NotConnected,
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),
    #[error("{action} failed on device '{device}'")]
    ExecutionFailed { device: String, action: String },
}

impl CommandError {
    /// Status code reported to the caller.
    pub fn status(&self) -> u16 {
        match self {
            CommandError::Malformed | CommandError::InvalidRate(_) => 400,
            CommandError::UnknownCommand(_) => 404,
            CommandError::NotConnected
            | CommandError::DeviceNotFound(_)
            | CommandError::ExecutionFailed { .. } => 500,
        }
    }
}

impl From<CommandError> for CommandResponse {
    fn from(err: CommandError) -> Self {
        CommandResponse::new(err.status(), err.to_string())
    }
}

/// The production rate one step below `current`, floored at the minimum.
///
/// Out-of-range readings are clamped first and off-step readings are rounded
/// down, so the result is always a valid rate.
pub fn next_lower_rate(current: i64) -> i64 {
    let clamped = current.clamp(MIN_PRODUCTION_RATE, MAX_PRODUCTION_RATE);
    let lowered = (clamped - PRODUCTION_RATE_STEP).max(MIN_PRODUCTION_RATE);
    lowered - lowered % PRODUCTION_RATE_STEP
}

/// Executes commands against the shared registry.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    fn connection(&self) -> &DeviceConnection {
        self.registry.connection()
    }

    /// Handle a decoded request.
    pub async fn handle(&self, request: &CommandRequest) -> CommandResponse {
        self.dispatch(&request.device, &request.command).await
    }

    /// Run `command` on `device`; always yields one of 200/400/404/500.
    pub async fn dispatch(&self, device: &str, command: &str) -> CommandResponse {
        match self.execute(device, command).await {
            Ok(message) => {
                info!(device = %device, command = %command, "Command executed");
                CommandResponse::ok(message)
            }
            Err(e) => {
                warn!(
                    device = %device,
                    command = %command,
                    status = e.status(),
                    error = %e,
                    "Command rejected"
                );
                e.into()
            }
        }
    }

    async fn execute(&self, device: &str, command: &str) -> Result<String, CommandError> {
        if device.trim().is_empty() || command.trim().is_empty() {
            return Err(CommandError::Malformed);
        }
        let command: DeviceCommand = command.parse()?;
        let record = self.resolve(device).await?;

        let done = match command {
            DeviceCommand::EmergencyStop => record.emergency_stop(self.connection()).await,
            DeviceCommand::ResetErrorStatus => record.reset_error_status(self.connection()).await,
            DeviceCommand::DecreaseProductionRate => {
                let rate = self.decrease_production_rate(&record).await?;
                return Ok(format!(
                    "Production rate of '{}' set to {}",
                    record.name, rate
                ));
            }
        };

        if done {
            Ok(format!("{} executed on '{}'", command, record.name))
        } else {
            Err(self.failure(&record.name, command.as_str()))
        }
    }

    /// Apply a desired production rate pushed for `device`.
    pub async fn apply_desired_rate(&self, device: &str, rate: i64) -> Result<(), CommandError> {
        if device.trim().is_empty() {
            return Err(CommandError::Malformed);
        }
        if !is_valid_production_rate(rate) {
            return Err(CommandError::InvalidRate(rate));
        }

        let record = self.resolve(device).await?;
        if record.set_production_rate(self.connection(), rate).await {
            info!(device = %record.name, rate, "Desired production rate applied");
            Ok(())
        } else {
            Err(self.failure(&record.name, "Setting production rate"))
        }
    }

    /// A device action failed; a dropped session is reported as such.
    fn failure(&self, device: &str, action: &str) -> CommandError {
        if self.connection().is_connected() {
            CommandError::ExecutionFailed {
                device: device.to_string(),
                action: action.to_string(),
            }
        } else {
            CommandError::NotConnected
        }
    }

    async fn resolve(&self, device: &str) -> Result<DeviceRecord, CommandError> {
        if !self.connection().ensure_connected().await {
            return Err(CommandError::NotConnected);
        }

        match self.registry.resolve(device).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(CommandError::DeviceNotFound(device.to_string())),
            Err(e) => {
                warn!(device = %device, error = %e, "Registry refresh failed");
                if self.connection().is_connected() {
                    Err(CommandError::DeviceNotFound(device.to_string()))
                } else {
                    Err(CommandError::NotConnected)
                }
            }
        }
    }

    async fn decrease_production_rate(&self, record: &DeviceRecord) -> Result<i64, CommandError> {
        let failed = || self.failure(&record.name, DeviceCommand::DecreaseProductionRate.as_str());

        let current = match self
            .connection()
            .read_field(&record.name, field::PRODUCTION_RATE)
            .await
        {
            Ok(value) => value.as_i64().ok_or_else(failed)?,
            Err(e) => {
                warn!(device = %record.name, error = %e, "Could not read production rate");
                return Err(failed());
            }
        };

        let next = next_lower_rate(current);
        if record.set_production_rate(self.connection(), next).await {
            Ok(next)
        } else {
            Err(failed())
        }
    }
}
