//! Audio duration probing via ffprobe.
//!
//! The probe reads container/stream metadata only - it never decodes the
//! audio. The ffprobe subprocess runs with a bounded timeout so a malformed
//! file cannot stall validation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// How long ffprobe may run before the probe gives up.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe the duration of an audio file in seconds.
///
/// Returns `None` when ffprobe is missing, times out, or cannot parse the
/// file. Callers decide whether an unknown duration is acceptable.
pub async fn probe_duration_seconds(path: &Path) -> Option<f64> {
    let child = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(PROBE_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!("ffprobe unavailable: {}", e);
            return None;
        }
        Err(_) => {
            debug!("ffprobe timed out after {:?} on {:?}", PROBE_TIMEOUT, path);
            return None;
        }
    };

    if !output.status.success() {
        debug!("ffprobe exited with {:?} for {:?}", output.status.code(), path);
        return None;
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ffprobe's `format=duration` csv output into seconds.
fn parse_probe_output(stdout: &str) -> Option<f64> {
    let duration: f64 = stdout.trim().parse().ok()?;
    if duration.is_finite() && duration >= 0.0 {
        Some(duration)
    } else {
        None
    }
}
