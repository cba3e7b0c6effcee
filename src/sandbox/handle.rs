//! Handle to an open isolation context.
//!
//! A [`SandboxHandle`] is owned exclusively by the request that opened it and
//! must be released exactly once on every exit path. Explicit release goes
//! through [`Sandbox::close`](super::Sandbox::close); the `Drop` impl is the
//! backstop that force-removes the context if an unwind skipped the
//! structured cleanup.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::warn;
use uuid::Uuid;

/// Resource limits applied to a sandbox at creation time.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Resident memory ceiling in megabytes.
    pub memory_mb: u64,
    /// CPU ceiling in percent of one core (100 = one full core).
    pub cpu_percent: u32,
}

/// Which isolation strategy backs a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxKind {
    /// Disposable container; carries the container name.
    Container {
        /// Docker container name (`audio-gate-<uuid>`).
        name: String,
    },
    /// Restricted filesystem subtree; carries the subtree root.
    Chroot {
        /// Root of the restricted subtree.
        root: PathBuf,
    },
}

impl SandboxKind {
    /// Short strategy label used in metadata and audit events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Container { .. } => "container",
            Self::Chroot { .. } => "chroot",
        }
    }
}

/// An open isolation context.
pub struct SandboxHandle {
    /// Unique identifier for this sandbox instance.
    pub id: Uuid,
    /// Isolation strategy and its locator.
    pub kind: SandboxKind,
    /// Limits this sandbox was created with.
    pub limits: ResourceLimits,
    /// Host-side workspace shared with the sandbox interior.
    ///
    /// Holding the `TempDir` ties workspace removal to handle teardown.
    pub(crate) workspace: TempDir,
    /// Set once `close` has run; makes close idempotent and disarms `Drop`.
    pub(crate) closed: bool,
}

impl SandboxHandle {
    /// Assemble a handle from an opened isolation context.
    ///
    /// Used by strategy implementations after they have created the backing
    /// context; the workspace `TempDir` ties host-side cleanup to the
    /// handle's lifetime.
    pub fn new(id: Uuid, kind: SandboxKind, limits: ResourceLimits, workspace: TempDir) -> Self {
        Self {
            id,
            kind,
            limits,
            workspace,
            closed: false,
        }
    }

    /// Mark the handle released, disarming the `Drop` backstop.
    ///
    /// Strategy `close` implementations call this once their teardown has
    /// run.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Host path of the workspace shared with the sandbox.
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Whether this handle has already been released.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Host directory whose contents appear at `/workspace` inside the
    /// sandbox.
    ///
    /// Containers bind-mount the workspace there; chroot subtrees carry a
    /// `workspace/` directory under the new root.
    pub fn staging_dir(&self) -> PathBuf {
        match &self.kind {
            SandboxKind::Container { .. } => self.workspace.path().to_path_buf(),
            SandboxKind::Chroot { .. } => self.workspace.path().join("workspace"),
        }
    }

    /// Path of a staged file as seen from inside the sandbox.
    pub fn interior_path(&self, file_name: &str) -> String {
        format!("/workspace/{}", file_name)
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Backstop: an unwind skipped the structured close. Synchronous
        // best-effort force removal; the startup GC catches anything that
        // survives a SIGKILL of the gateway itself.
        warn!("SandboxHandle {} dropped without close, force-removing", self.id);
        if let SandboxKind::Container { name } = &self.kind {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", name])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        }
        // Chroot subtrees live inside the workspace TempDir, which removes
        // itself after this body runs.
    }
}
