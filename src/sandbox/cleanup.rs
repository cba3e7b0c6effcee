//! Startup garbage collection for crashed sessions.
//!
//! Teardown normally runs through `Sandbox::close` or the handle's `Drop`
//! backstop. Neither runs when the gateway is killed via SIGKILL or the
//! host loses power, which leaves:
//!
//! - Stale `audio-gate-*` containers in the Docker daemon
//! - Orphaned workspace directories in the temp dir and chroot base
//!
//! This module sweeps both at startup, before any new sandbox is created.

use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::SystemTime;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::chroot::CHROOT_PREFIX;
use super::docker::CONTAINER_PREFIX;

/// Workspace directories older than this are considered stale.
const STALE_AGE_SECS: u64 = 86400;

/// Stale resources found on the system.
#[derive(Debug, Default)]
pub struct StaleResources {
    /// Names of stale containers.
    pub containers: Vec<String>,
    /// Paths of stale workspace directories.
    pub workspaces: Vec<std::path::PathBuf>,
}

impl StaleResources {
    /// Whether anything stale was found.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.workspaces.is_empty()
    }

    /// Total count of stale resources.
    pub fn count(&self) -> usize {
        self.containers.len() + self.workspaces.len()
    }
}

/// Clean up stale resources from previous crashed sessions.
///
/// Call early in startup, before creating new sandbox resources. Errors are
/// logged and swallowed; GC must never prevent the gateway from starting.
pub async fn cleanup_stale_resources(chroot_base: &Path) {
    info!("Checking for stale resources from crashed sessions");
    cleanup_stale_containers().await;
    cleanup_stale_dirs(&std::env::temp_dir(), CONTAINER_PREFIX);
    cleanup_stale_dirs(chroot_base, CHROOT_PREFIX);
}

/// Force-remove containers left behind by a crashed session.
async fn cleanup_stale_containers() {
    for name in list_stale_containers().await {
        info!("Removing stale container {}", name);
        let result = Command::new("docker")
            .args(["rm", "-f", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!("Failed to remove stale container {}: {}", name, e);
        }
    }
}

/// List containers carrying our name prefix.
async fn list_stale_containers() -> Vec<String> {
    let output = Command::new("docker")
        .args([
            "ps",
            "-a",
            "--filter",
            &format!("name={}", CONTAINER_PREFIX),
            "--format",
            "{{.Names}}",
        ])
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|name| name.starts_with(CONTAINER_PREFIX))
            .map(str::to_string)
            .collect(),
        Ok(_) | Err(_) => {
            debug!("Docker not reachable, skipping container GC");
            Vec::new()
        }
    }
}

/// Remove prefix-matching directories older than the stale age.
fn cleanup_stale_dirs(base: &Path, prefix: &str) {
    let entries = match fs::read_dir(base) {
        Ok(e) => e,
        Err(e) => {
            debug!("Cannot read {:?}: {}", base, e);
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if !name_str.starts_with(prefix) {
            continue;
        }

        let is_stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age.as_secs() > STALE_AGE_SECS)
            .unwrap_or(false);

        if is_stale {
            info!("Removing stale workspace {:?}", entry.path());
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("Failed to remove stale workspace {:?}: {}", entry.path(), e);
            }
        } else {
            debug!("Workspace {:?} is recent, skipping", entry.path());
        }
    }
}

/// List stale resources without removing anything (diagnostics).
pub async fn list_stale_resources(chroot_base: &Path) -> StaleResources {
    let mut resources = StaleResources {
        containers: list_stale_containers().await,
        workspaces: Vec::new(),
    };

    for (base, prefix) in [
        (std::env::temp_dir(), CONTAINER_PREFIX),
        (chroot_base.to_path_buf(), CHROOT_PREFIX),
    ] {
        if let Ok(entries) = fs::read_dir(&base) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let old = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .map(|age| age.as_secs() > STALE_AGE_SECS)
                    .unwrap_or(false);
                if name.starts_with(prefix) && old {
                    resources.workspaces.push(entry.path());
                }
            }
        }
    }

    resources
}
