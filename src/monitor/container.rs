//! Container resource sampling via the container runtime.
//!
//! Pipelines running under the container strategy are parented to the
//! runtime's shim, not to the gateway, so walking `/proc` from the client
//! pid never reaches them. For those runs the runtime's own cgroup-backed
//! accounting (`docker stats`) is the authoritative source.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// One sample of a container's aggregate resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerSample {
    /// Memory in use, in MB.
    pub rss_mb: u64,
    /// CPU usage in percent of one core, as reported by the runtime.
    pub cpu_percent: f64,
    /// Number of processes inside the container.
    pub process_count: usize,
}

/// Sample a container by name.
///
/// Returns `None` when the container is gone or the runtime is unreachable,
/// the signal that the supervised run has finished. `--no-stream` still
/// samples twice internally, so one call takes about a second.
pub async fn sample_container(name: &str) -> Option<ContainerSample> {
    let output = Command::new("docker")
        .args([
            "stats",
            "--no-stream",
            "--format",
            "{{.MemUsage}}\t{{.CPUPerc}}\t{{.PIDs}}",
            name,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        debug!("docker stats failed for {}", name);
        return None;
    }
    parse_stats_line(String::from_utf8_lossy(&output.stdout).trim())
}

/// Parse one formatted stats line: `512.3MiB / 2GiB<TAB>87.45%<TAB>12`.
pub fn parse_stats_line(line: &str) -> Option<ContainerSample> {
    let mut fields = line.split('\t');
    let mem = fields.next()?;
    let cpu = fields.next()?;
    let pids = fields.next()?;
    Some(ContainerSample {
        rss_mb: parse_mem_usage_mb(mem)?,
        cpu_percent: parse_percent(cpu)?,
        process_count: pids.trim().parse().ok()?,
    })
}

/// Parse the usage half of a `MemUsage` field (`512.3MiB / 2GiB`) into MB.
fn parse_mem_usage_mb(field: &str) -> Option<u64> {
    let used = field.split('/').next()?.trim();
    let unit_start = used.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = used.split_at(unit_start);
    let value: f64 = number.trim().parse().ok()?;
    let bytes = match unit.trim() {
        "B" => value,
        "KiB" => value * 1024.0,
        "kB" | "KB" => value * 1000.0,
        "MiB" => value * 1024.0 * 1024.0,
        "MB" => value * 1e6,
        "GiB" => value * 1024.0 * 1024.0 * 1024.0,
        "GB" => value * 1e9,
        _ => return None,
    };
    Some((bytes / (1024.0 * 1024.0)) as u64)
}

/// Parse a `CPUPerc` field (`87.45%`).
fn parse_percent(field: &str) -> Option<f64> {
    field.trim().strip_suffix('%')?.trim().parse().ok()
}
