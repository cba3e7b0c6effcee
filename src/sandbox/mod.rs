//! Isolated execution contexts for the transcription pipeline.
//!
//! # Security Model
//!
//! The pipeline binary processes attacker-controlled input, so it never runs
//! on the bare host. Every run gets a fresh isolation context with resource
//! limits applied at creation time, and the context is destroyed when the
//! run finishes regardless of outcome.
//!
//! Two strategies implement the [`Sandbox`] trait:
//!
//! - [`DockerSandbox`]: a disposable container per run. Preferred; gives
//!   namespace isolation, cgroup limits, capability drop and no network.
//! - [`ChrootSandbox`]: a restricted filesystem subtree. Weaker fallback for
//!   hosts without a container runtime; requires root.
//!
//! [`SandboxBackend`] selects between them from configuration and fails
//! closed: if no enabled strategy can actually open a context, the run is
//! rejected rather than executed unconfined.

mod chroot;
pub mod cleanup;
mod docker;
mod error;
mod handle;

pub use chroot::ChrootSandbox;
pub use docker::{DockerSandbox, CONTAINER_WORKSPACE};
pub use error::SandboxError;
pub use handle::{ResourceLimits, SandboxHandle, SandboxKind};

use tokio::process::Child;
use tracing::warn;

use crate::config::SecurityConfig;

/// An isolation strategy the gateway can run the pipeline under.
///
/// Implementations must uphold the handle lifecycle: a handle returned by
/// `open` is released exactly once, either through `close` or through its
/// `Drop` backstop, and `close` is idempotent.
pub trait Sandbox: Send + Sync {
    /// Short strategy name for logs and metadata.
    fn kind_name(&self) -> &'static str;

    /// Create a fresh isolation context with the given limits.
    fn open(
        &self,
        limits: ResourceLimits,
    ) -> impl std::future::Future<Output = Result<SandboxHandle, SandboxError>> + Send;

    /// Spawn a command inside an open context.
    ///
    /// The child is placed in its own process group so the whole tree can be
    /// signalled together.
    fn spawn_in(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
    ) -> impl std::future::Future<Output = Result<Child, SandboxError>> + Send;

    /// Release a context. Idempotent.
    fn close(
        &self,
        handle: &mut SandboxHandle,
    ) -> impl std::future::Future<Output = Result<(), SandboxError>> + Send;
}

/// Configured strategy selection with fail-closed fallback.
pub enum SandboxBackend {
    /// Container strategy, optionally falling back to chroot when the
    /// container runtime is unreachable.
    Docker {
        /// Primary container strategy.
        docker: DockerSandbox,
        /// Fallback used only when opening a container fails with a
        /// runtime-unavailable error.
        fallback: Option<ChrootSandbox>,
    },
    /// Chroot as the sole strategy.
    Chroot(ChrootSandbox),
}

impl SandboxBackend {
    /// Build the backend from configuration.
    ///
    /// Fails closed: when neither strategy is enabled there is nothing safe
    /// to run under, so construction itself errors.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, SandboxError> {
        let sandbox = &config.sandbox;
        if sandbox.use_docker_sandbox {
            let fallback = sandbox
                .use_chroot
                .then(|| ChrootSandbox::new(&sandbox.chroot_dir));
            Ok(Self::Docker {
                docker: DockerSandbox::new(&*sandbox.docker_image),
                fallback,
            })
        } else if sandbox.use_chroot {
            Ok(Self::Chroot(ChrootSandbox::new(&sandbox.chroot_dir)))
        } else {
            Err(SandboxError::RuntimeUnavailable(
                "no isolation strategy enabled in configuration".to_string(),
            ))
        }
    }
}

impl Sandbox for SandboxBackend {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Docker { .. } => "container",
            Self::Chroot(_) => "chroot",
        }
    }

    async fn open(&self, limits: ResourceLimits) -> Result<SandboxHandle, SandboxError> {
        match self {
            Self::Docker { docker, fallback } => match docker.open(limits).await {
                Ok(handle) => Ok(handle),
                Err(SandboxError::RuntimeUnavailable(reason)) => {
                    let Some(chroot) = fallback else {
                        return Err(SandboxError::RuntimeUnavailable(reason));
                    };
                    warn!(
                        "Container runtime unavailable ({}), falling back to chroot",
                        reason
                    );
                    chroot.open(limits).await
                }
                Err(e) => Err(e),
            },
            Self::Chroot(chroot) => chroot.open(limits).await,
        }
    }

    async fn spawn_in(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
    ) -> Result<Child, SandboxError> {
        // Route on the handle, not the configured primary: a fallback-opened
        // handle must be driven by the strategy that opened it.
        match (&handle.kind, self) {
            (SandboxKind::Container { .. }, Self::Docker { docker, .. }) => {
                docker.spawn_in(handle, argv).await
            }
            (SandboxKind::Chroot { .. }, Self::Docker { fallback: Some(chroot), .. }) => {
                chroot.spawn_in(handle, argv).await
            }
            (SandboxKind::Chroot { .. }, Self::Chroot(chroot)) => {
                chroot.spawn_in(handle, argv).await
            }
            _ => Err(SandboxError::Spawn(std::io::Error::other(
                "handle does not match any configured strategy",
            ))),
        }
    }

    async fn close(&self, handle: &mut SandboxHandle) -> Result<(), SandboxError> {
        match (&handle.kind, self) {
            (SandboxKind::Container { .. }, Self::Docker { docker, .. }) => {
                docker.close(handle).await
            }
            (SandboxKind::Chroot { .. }, Self::Docker { fallback: Some(chroot), .. }) => {
                chroot.close(handle).await
            }
            (SandboxKind::Chroot { .. }, Self::Chroot(chroot)) => chroot.close(handle).await,
            _ => {
                // Nothing we can drive; mark closed so Drop does not fire.
                handle.closed = true;
                Ok(())
            }
        }
    }
}
