//! Error types for remote artifact fetching.

use thiserror::Error;

/// Unified error type for fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested host is not on the configured allowlist. Raised before
    /// any socket is opened.
    #[error("Host not in the fetch allowlist: {host}")]
    HostNotAllowed {
        /// The rejected host.
        host: String,
    },

    /// Plaintext FTP was requested but is disabled by policy.
    #[error("Plaintext FTP is disabled; use SFTP or enable allow_plaintext_ftp")]
    PlaintextDisabled,

    /// Anonymous or empty credentials were supplied.
    #[error("Anonymous credentials are not permitted for remote fetch")]
    AnonymousCredentials,

    /// Could not establish the transport connection.
    #[error("Connection to {host} failed: {message}")]
    Connect {
        /// Target host.
        host: String,
        /// Underlying failure description.
        message: String,
    },

    /// The server rejected the supplied credentials.
    #[error("Authentication failed for {username}@{host}")]
    AuthFailed {
        /// Username that was rejected.
        username: String,
        /// Target host.
        host: String,
    },

    /// The transfer itself failed.
    #[error("Transfer of {remote_path} failed: {message}")]
    Transfer {
        /// Remote path being fetched.
        remote_path: String,
        /// Underlying failure description.
        message: String,
    },

    /// The fetched bytes do not match the expected digest. The partial
    /// local file has been deleted.
    #[error("Checksum mismatch for {remote_path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Remote path that was fetched.
        remote_path: String,
        /// Digest the caller expected.
        expected: String,
        /// Digest of the bytes actually received.
        actual: String,
    },

    /// Local filesystem failure while persisting the fetched bytes.
    #[error("Failed to write fetched file: {0}")]
    LocalWrite(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let err = FetchError::ChecksumMismatch {
            remote_path: "/incoming/a.wav".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/incoming/a.wav"));
        assert!(msg.contains("expected aa"));
    }
}
