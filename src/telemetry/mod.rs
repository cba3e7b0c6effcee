//! Telemetry and audit logging.
//!
//! Structured security events go to syslog with the `AUDIO_GATE` tag for
//! SIEM integration; development logs go to stderr via `tracing`. The two
//! are completely separate concerns.
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-08-31T14:32:01Z","event":"run_rejected","file":"call.mp3","reason":"injection threshold"}
//! ```

mod error;
mod events;
mod logger;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use logger::{audit, init_logger, try_audit, AuditLogger, SYSLOG_TAG};
