//! Container isolation via disposable Docker containers.
//!
//! Each run gets a freshly created container from a pinned base image, with
//! CPU/memory limits applied at creation time, elevated capabilities
//! dropped, and privilege escalation disabled. The host-side workspace is
//! the only bind mount.
//!
//! Containers are named `audio-gate-<uuid>` so the startup GC in
//! [`cleanup`](super::cleanup) can find strays from crashed sessions.

use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::SandboxError;
use super::handle::{ResourceLimits, SandboxHandle, SandboxKind};
use super::Sandbox;

/// Container name prefix; shared with the startup GC.
pub const CONTAINER_PREFIX: &str = "audio-gate-";

/// Mount point of the shared workspace inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// How long the idle keepalive process sleeps before the container exits on
/// its own, as a backstop against leaked containers.
const KEEPALIVE_SECONDS: u32 = 3600;

/// Disposable-container isolation strategy.
pub struct DockerSandbox {
    image: String,
}

impl DockerSandbox {
    /// Create a strategy using the given pinned base image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    async fn docker(args: &[&str]) -> Result<std::process::Output, SandboxError> {
        Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("cannot run docker: {}", e)))
    }
}

impl Sandbox for DockerSandbox {
    fn kind_name(&self) -> &'static str {
        "container"
    }

    async fn open(&self, limits: ResourceLimits) -> Result<SandboxHandle, SandboxError> {
        let id = Uuid::new_v4();
        let name = format!("{}{}", CONTAINER_PREFIX, id.simple());

        let workspace = tempfile::Builder::new()
            .prefix(CONTAINER_PREFIX)
            .tempdir()
            .map_err(SandboxError::Workspace)?;

        let memory = format!("{}m", limits.memory_mb);
        let cpus = format!("{:.2}", f64::from(limits.cpu_percent) / 100.0);
        let volume = format!("{}:{}", workspace.path().display(), CONTAINER_WORKSPACE);

        let output = Self::docker(&[
            "run",
            "-d",
            "--name",
            &name,
            "-v",
            &volume,
            "--memory",
            &memory,
            "--cpus",
            &cpus,
            "--security-opt",
            "no-new-privileges",
            "--cap-drop",
            "ALL",
            "--network",
            "none",
            &self.image,
            "sleep",
            &KEEPALIVE_SECONDS.to_string(),
        ])
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // A dead daemon and a bad image look the same to the caller:
            // the configured strategy is unavailable, fail closed.
            return Err(SandboxError::RuntimeUnavailable(format!(
                "docker run failed (code {:?}): {}",
                output.status.code(),
                stderr
            )));
        }

        info!("Opened container sandbox {}", name);
        Ok(SandboxHandle {
            id,
            kind: SandboxKind::Container { name },
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
        let SandboxKind::Container { name } = &handle.kind else {
            return Err(SandboxError::Spawn(std::io::Error::other(
                "handle does not belong to the container strategy",
            )));
        };

        debug!("Spawning in container {}: {:?}", name, argv);
        Command::new("docker")
            .arg("exec")
            .arg("--workdir")
            .arg(CONTAINER_WORKSPACE)
            .arg(name)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(SandboxError::Spawn)
    }

    async fn close(&self, handle: &mut SandboxHandle) -> Result<(), SandboxError> {
        if handle.closed {
            return Ok(());
        }

        let SandboxKind::Container { name } = &handle.kind else {
            handle.closed = true;
            return Ok(());
        };

        // Force removal works whether the supervised process is still
        // alive, already exited, or crashed the container.
        let output = Self::docker(&["rm", "-f", name]).await?;
        handle.closed = true;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // "No such container" means someone (GC, daemon restart) beat
            // us to it; that still satisfies the teardown contract.
            if !stderr.contains("No such container") {
                return Err(SandboxError::Teardown {
                    id: name.clone(),
                    message: stderr,
                });
            }
        }

        info!("Closed container sandbox {}", name);
        Ok(())
    }
}
