//! Error types for telemetry.

use thiserror::Error;

/// Errors that can occur in the telemetry subsystem.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Could not connect to the local syslog daemon.
    #[error("Syslog connection failed: {0}")]
    SyslogConnection(String),

    /// The global audit logger was initialized twice.
    #[error("Audit logger already initialized")]
    AlreadyInitialized,
}
