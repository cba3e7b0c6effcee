//! Top-level error taxonomy for the gateway.
//!
//! Every failure is terminal for its request: the gateway never retries on
//! its own, and no error is silently swallowed. Callers receive one of the
//! variants below with structured detail attached.

use thiserror::Error;

use crate::config::ConfigError;
use crate::fetch::FetchError;
use crate::sandbox::SandboxError;

/// Unified error type surfaced by the gateway to callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Input failed admission checks (format, size, duration, MIME).
    ///
    /// Fails fast; no sandbox or admission slot was consumed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The admission queue is full; the request was rejected immediately.
    #[error("Admission rejected: queue full ({max_queue_depth} waiting)")]
    AdmissionRejected {
        /// Configured queue depth at the time of rejection.
        max_queue_depth: usize,
    },

    /// The configured isolation strategy cannot be created and no fallback
    /// is permitted. The gateway fails closed; it never runs unsandboxed.
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// The supervised process exceeded a resource threshold and was
    /// terminated; partial output was discarded.
    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// The supervised process overran its wall-clock deadline and was
    /// terminated; partial output was discarded.
    #[error("Pipeline timed out after {seconds}s")]
    TimedOut {
        /// Configured deadline in seconds.
        seconds: u64,
    },

    /// The pipeline process exited abnormally.
    #[error("Pipeline crashed with exit code {exit_code:?}")]
    Crashed {
        /// Exit code if the process exited (None if killed by signal).
        exit_code: Option<i32>,
    },

    /// The transcript matched too many injection signatures; the run was
    /// rejected post-hoc and nothing was persisted.
    #[error("Injection threshold exceeded: {matched} patterns matched (limit {limit})")]
    InjectionThresholdExceeded {
        /// Distinct counted patterns that matched.
        matched: usize,
        /// Configured rejection threshold.
        limit: usize,
    },

    /// Network policy violation: host not allow-listed or checksum mismatch.
    #[error("Network policy violation: {0}")]
    NetworkPolicy(#[from] FetchError),

    /// Sandbox lifecycle failure.
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Failed to persist the result artifacts.
    #[error("Failed to persist results: {0}")]
    Persist(#[source] std::io::Error),

    /// Configuration failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The external analysis collaborator failed.
    #[error("Analysis failed: {0}")]
    Analysis(String),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = GatewayError::Validation("file too large: 250.0MB > 200MB".to_string());
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_injection_threshold_display() {
        let err = GatewayError::InjectionThresholdExceeded {
            matched: 4,
            limit: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_timed_out_display() {
        let err = GatewayError::TimedOut { seconds: 3600 };
        assert!(err.to_string().contains("3600"));
    }
}
