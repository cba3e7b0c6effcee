//! Error types for sandbox operations.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The isolation runtime (Docker daemon, chroot privilege) cannot be
    /// reached or used. The gateway fails closed on this error unless a
    /// fallback strategy is configured.
    #[error("Isolation runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Failed to create the sandbox workspace on the host.
    #[error("Failed to prepare sandbox workspace: {0}")]
    Workspace(#[source] std::io::Error),

    /// Failed to spawn a process inside the sandbox.
    #[error("Failed to spawn sandboxed process: {0}")]
    Spawn(#[source] std::io::Error),

    /// A sandbox management command (docker create/rm, chroot setup)
    /// exited with an error.
    #[error("Sandbox command failed with code {code:?}: {stderr}")]
    CommandFailed {
        /// Exit code, if the command exited.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// Teardown could not fully remove the isolation context.
    #[error("Sandbox teardown incomplete for {id}: {message}")]
    Teardown {
        /// Identifier of the sandbox that leaked.
        id: String,
        /// Description of what was left behind.
        message: String,
    },

    /// A required path does not exist.
    #[error("Required path does not exist: {path:?}")]
    PathNotFound {
        /// The missing path.
        path: PathBuf,
    },
}
