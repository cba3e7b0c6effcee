//! Audit event types for structured security logging.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
///
/// Each variant represents a significant security-relevant event in the
/// lifecycle of a gateway run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A file passed validation and entered the admission queue.
    RunAdmitted {
        /// File name (not full path; paths may carry user data).
        file: String,
        /// SHA-256 of the file contents.
        checksum: String,
    },

    /// A file failed validation before any resources were consumed.
    ValidationRejected {
        /// File name.
        file: String,
        /// Human-readable rejection reason.
        reason: String,
    },

    /// A request was turned away because the admission queue was full.
    AdmissionRejected {
        /// File name.
        file: String,
    },

    /// A sandbox was opened for a run.
    SandboxOpened {
        /// Sandbox identifier.
        sandbox_id: String,
        /// Isolation strategy ("container" or "chroot").
        kind: String,
    },

    /// A sandbox was torn down.
    SandboxClosed {
        /// Sandbox identifier.
        sandbox_id: String,
        /// Whether teardown had to force-remove a live process.
        forced: bool,
    },

    /// The supervised pipeline was terminated by the gateway.
    PipelineTerminated {
        /// PID of the supervised process.
        pid: u32,
        /// Why the process was killed ("timeout", "cpu", "memory").
        cause: String,
    },

    /// Injection signatures matched the transcript.
    InjectionDetected {
        /// File name.
        file: String,
        /// Ordered list of matched pattern identifiers.
        patterns: Vec<String>,
        /// Whether the run was rejected (vs. sanitized and forwarded).
        rejected: bool,
    },

    /// The analysis collaborator returned a non-conforming response.
    AnalysisNonConforming {
        /// File name.
        file: String,
    },

    /// A remote fetch was denied by policy before any socket was opened.
    FetchDenied {
        /// Target host.
        host: String,
        /// Policy reason.
        reason: String,
    },

    /// A fetched file failed its expected checksum and was deleted.
    FetchChecksumMismatch {
        /// Target host.
        host: String,
        /// Remote path that was fetched.
        remote_path: String,
    },

    /// A run reached a terminal state.
    RunFinished {
        /// File name.
        file: String,
        /// Terminal outcome ("success", "rejected", "failed").
        outcome: String,
        /// Wall-clock processing time in milliseconds.
        processing_time_ms: u64,
    },
}

/// Wrapper for serializing events with a timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_admitted_serialization() {
        let event = AuditEvent::RunAdmitted {
            file: "call.mp3".to_string(),
            checksum: "ab12".to_string(),
        };
        let json = serde_json::to_string(&event.with_timestamp()).unwrap();
        assert!(json.contains("\"event\":\"run_admitted\""));
        assert!(json.contains("\"file\":\"call.mp3\""));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_injection_detected_serialization() {
        let event = AuditEvent::InjectionDetected {
            file: "call.mp3".to_string(),
            patterns: vec!["instruction-override-en".to_string()],
            rejected: true,
        };
        let json = serde_json::to_string(&event.with_timestamp()).unwrap();
        assert!(json.contains("\"event\":\"injection_detected\""));
        assert!(json.contains("instruction-override-en"));
        assert!(json.contains("\"rejected\":true"));
    }

    #[test]
    fn test_fetch_denied_serialization() {
        let event = AuditEvent::FetchDenied {
            host: "evil.example".to_string(),
            reason: "host not in allowlist".to_string(),
        };
        let json = serde_json::to_string(&event.with_timestamp()).unwrap();
        assert!(json.contains("\"event\":\"fetch_denied\""));
        assert!(json.contains("evil.example"));
    }

    #[test]
    fn test_run_finished_serialization() {
        let event = AuditEvent::RunFinished {
            file: "call.mp3".to_string(),
            outcome: "success".to_string(),
            processing_time_ms: 4230,
        };
        let json = serde_json::to_string(&event.with_timestamp()).unwrap();
        assert!(json.contains("\"event\":\"run_finished\""));
        assert!(json.contains("\"processing_time_ms\":4230"));
    }
}
