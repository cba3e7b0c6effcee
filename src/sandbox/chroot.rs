//! Filesystem-root isolation as the container-free fallback.
//!
//! Confines the pipeline invocation to a restricted subtree via `chroot(8)`.
//! Weaker than the container strategy (no PID/network namespace, no cgroup
//! limits at creation time - those are enforced by the resource monitor),
//! but it has no runtime dependency beyond the privilege to chroot.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::SandboxError;
use super::handle::{ResourceLimits, SandboxHandle, SandboxKind};
use super::Sandbox;

/// Workspace prefix; shared with the startup GC.
pub const CHROOT_PREFIX: &str = "audio-gate-root-";

/// Libraries copied into the subtree so a minimal toolchain can run.
const BASE_LIBS: &[&str] = &[
    "/lib/x86_64-linux-gnu/libc.so.6",
    "/lib/x86_64-linux-gnu/libm.so.6",
    "/lib64/ld-linux-x86-64.so.2",
];

/// Restricted-subtree isolation strategy.
pub struct ChrootSandbox {
    base_dir: PathBuf,
}

impl ChrootSandbox {
    /// Create a strategy rooting its subtrees under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Copy the minimal library set into the subtree, skipping any that are
    /// absent on this host.
    fn populate_subtree(root: &Path) -> std::io::Result<()> {
        for lib in BASE_LIBS {
            let src = Path::new(lib);
            if !src.exists() {
                continue;
            }
            let target = root.join(lib.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(src, &target)?;
        }
        std::fs::create_dir_all(root.join("workspace"))?;
        Ok(())
    }
}

impl Sandbox for ChrootSandbox {
    fn kind_name(&self) -> &'static str {
        "chroot"
    }

    async fn open(&self, limits: ResourceLimits) -> Result<SandboxHandle, SandboxError> {
        // chroot(2) needs CAP_SYS_CHROOT; probe up front so the failure is
        // a clean fail-closed rejection, not a confusing spawn error later.
        if !nix::unistd::geteuid().is_root() {
            return Err(SandboxError::RuntimeUnavailable(
                "chroot isolation requires root privileges".to_string(),
            ));
        }

        std::fs::create_dir_all(&self.base_dir).map_err(SandboxError::Workspace)?;

        let id = Uuid::new_v4();
        let workspace = tempfile::Builder::new()
            .prefix(CHROOT_PREFIX)
            .tempdir_in(&self.base_dir)
            .map_err(SandboxError::Workspace)?;

        let root = workspace.path().to_path_buf();
        Self::populate_subtree(&root).map_err(SandboxError::Workspace)?;

        info!("Opened chroot sandbox at {:?}", root);
        Ok(SandboxHandle {
            id,
            kind: SandboxKind::Chroot { root },
            limits,
            workspace,
            closed: false,
        })
    }

    async fn spawn_in(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
    ) -> Result<Child, SandboxError> {
        let SandboxKind::Chroot { root } = &handle.kind else {
            return Err(SandboxError::Spawn(std::io::Error::other(
                "handle does not belong to the chroot strategy",
            )));
        };

        debug!("Spawning in chroot {:?}: {:?}", root, argv);
        Command::new("chroot")
            .arg(root)
            .args(argv)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Spawn)
    }

    async fn close(&self, handle: &mut SandboxHandle) -> Result<(), SandboxError> {
        // The subtree lives inside the workspace TempDir; marking the handle
        // closed is all that is needed, removal happens when the handle is
        // dropped. Idempotent by construction.
        handle.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populate_subtree_creates_workspace() {
        let dir = tempfile::tempdir().unwrap();
        ChrootSandbox::populate_subtree(dir.path()).unwrap();
        assert!(dir.path().join("workspace").is_dir());
    }

    #[tokio::test]
    async fn test_open_fails_closed_without_root() {
        if nix::unistd::geteuid().is_root() {
            // Privileged environments exercise the happy path elsewhere.
            return;
        }
        let sandbox = ChrootSandbox::new(tempfile::tempdir().unwrap().path());
        let result = sandbox
            .open(ResourceLimits {
                memory_mb: 128,
                cpu_percent: 50,
            })
            .await;
        assert!(matches!(result, Err(SandboxError::RuntimeUnavailable(_))));
    }
}
