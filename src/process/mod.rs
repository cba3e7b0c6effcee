//! Supervised execution of the transcription pipeline.
//!
//! [`ProcessManager::execute`] owns the full lifecycle of one sandboxed run:
//! open the sandbox, stage the input, spawn the pipeline, race its exit
//! against the wall-clock deadline and the resource monitor, and tear
//! everything down on every exit path. Termination is graceful-then-forced:
//! SIGTERM to the process group, a configurable grace period, then SIGKILL.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MonitorConfig, ProcessConfig};
use crate::error::GatewayError;
use crate::monitor::{
    ActiveProcessRecord, MonitorTarget, ProcessRegistry, ResourceBreach, ResourceMonitor,
    ResourceUsageSummary,
};
use crate::sandbox::{ResourceLimits, Sandbox, SandboxHandle, SandboxKind};
use crate::telemetry::{audit, AuditEvent};

/// Name of the output directory inside the sandbox workspace.
const OUTPUT_SUBDIR: &str = "out";

/// How one supervised pipeline invocation ended.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The pipeline exited zero within all limits.
    Completed {
        /// Captured standard output.
        stdout: String,
    },
    /// The wall-clock deadline elapsed and the tree was terminated.
    TimedOut {
        /// The deadline that was enforced, in seconds.
        seconds: u64,
    },
    /// The resource monitor reported a breach and the tree was terminated.
    ResourceExceeded {
        /// The breach that triggered termination.
        breach: ResourceBreach,
    },
    /// The pipeline exited nonzero or was killed by an outside signal.
    Crashed {
        /// Exit code, when the process exited rather than died to a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}

impl ProcessOutcome {
    /// Short label for audit events and metadata.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::TimedOut { .. } => "timed_out",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::Crashed { .. } => "crashed",
        }
    }
}

/// Result of one supervised run.
#[derive(Debug)]
pub struct SupervisedRun {
    /// How the pipeline ended.
    pub outcome: ProcessOutcome,
    /// Peak resource usage observed while it ran.
    pub usage: ResourceUsageSummary,
    /// Transcript text recovered from the output directory, when present.
    pub transcript: Option<String>,
    /// Which isolation strategy actually hosted the run.
    pub sandbox_kind: String,
}

/// Owns sandboxed pipeline execution end to end.
pub struct ProcessManager {
    process: ProcessConfig,
    monitor: ResourceMonitor,
    registry: Arc<ProcessRegistry>,
}

impl ProcessManager {
    /// Create a manager with the given supervision policy.
    pub fn new(
        process: ProcessConfig,
        monitor: MonitorConfig,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            process,
            monitor: ResourceMonitor::new(monitor),
            registry,
        }
    }

    /// Expand the pipeline command template for one staged input.
    fn expand_command(&self, input_path: &str, output_dir: &str) -> Vec<String> {
        self.process
            .transcribe_command
            .iter()
            .map(|part| {
                part.replace("{input}", input_path)
                    .replace("{output_dir}", output_dir)
            })
            .collect()
    }

    /// Run the pipeline over `input` inside a fresh sandbox.
    ///
    /// Infrastructure failures (sandbox cannot open, input cannot be
    /// staged) are errors; supervised terminal states (timeout, breach,
    /// crash) are `Ok` outcomes the caller maps to its own verdict. The
    /// sandbox is closed on every path.
    pub async fn execute<S: Sandbox>(
        &self,
        sandbox: &S,
        limits: ResourceLimits,
        run_id: Uuid,
        input: &Path,
    ) -> Result<SupervisedRun, GatewayError> {
        let mut handle = sandbox.open(limits).await?;
        audit().log(AuditEvent::SandboxOpened {
            sandbox_id: handle.id.to_string(),
            kind: handle.kind.label().to_string(),
        });

        let result = self.run_supervised(sandbox, &handle, run_id, input).await;

        let forced = !matches!(
            result,
            Ok(SupervisedRun {
                outcome: ProcessOutcome::Completed { .. },
                ..
            })
        );
        if let Err(e) = sandbox.close(&mut handle).await {
            // The run verdict stands; the startup GC covers the leak.
            warn!("Sandbox {} teardown incomplete: {}", handle.id, e);
        }
        audit().log(AuditEvent::SandboxClosed {
            sandbox_id: handle.id.to_string(),
            forced,
        });

        result
    }

    async fn run_supervised<S: Sandbox>(
        &self,
        sandbox: &S,
        handle: &SandboxHandle,
        run_id: Uuid,
        input: &Path,
    ) -> Result<SupervisedRun, GatewayError> {
        let file_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GatewayError::Validation("input file has no usable name".into()))?
            .to_string();

        let staging = handle.staging_dir();
        tokio::fs::create_dir_all(staging.join(OUTPUT_SUBDIR)).await?;
        tokio::fs::copy(input, staging.join(&file_name)).await?;

        let argv = self.expand_command(
            &handle.interior_path(&file_name),
            &handle.interior_path(OUTPUT_SUBDIR),
        );
        debug!(run_id = %run_id, ?argv, "Spawning pipeline");

        let mut child = sandbox.spawn_in(handle, &argv).await?;
        let pid = child
            .id()
            .ok_or_else(|| GatewayError::Crashed { exit_code: None })?;

        self.registry.register(ActiveProcessRecord {
            pid,
            run_id,
            sandbox_id: handle.id,
            started_at: Utc::now(),
            memory_limit_mb: handle.limits.memory_mb,
            cpu_limit_percent: handle.limits.cpu_percent,
        });
        let (monitor_task, breach_rx) = self.monitor.start(monitor_target(handle, pid));

        let (outcome, stdout, stderr) = self
            .supervise(&mut child, pid, breach_rx)
            .await;

        let usage = monitor_task.stop().await;
        self.registry.deregister(pid);

        let outcome = map_outcome(
            outcome,
            pid,
            self.process.max_transcription_time_seconds,
            stdout,
            stderr,
        );

        let transcript = if matches!(outcome, ProcessOutcome::Completed { .. }) {
            collect_transcript(&staging.join(OUTPUT_SUBDIR), &file_name).await
        } else {
            None
        };

        info!(run_id = %run_id, outcome = outcome.label(), "Pipeline run finished");
        Ok(SupervisedRun {
            outcome,
            usage,
            transcript,
            sandbox_kind: handle.kind.label().to_string(),
        })
    }

    /// Race the child against the deadline and the breach channel.
    async fn supervise(
        &self,
        child: &mut Child,
        pid: u32,
        mut breach_rx: mpsc::Receiver<ResourceBreach>,
    ) -> (RawOutcome, String, String) {
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_pipe(stdout_pipe));
        let stderr_task = tokio::spawn(read_pipe(stderr_pipe));

        let deadline = tokio::time::sleep(self.process.deadline());
        tokio::pin!(deadline);

        let raw = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => RawOutcome::Exited(status),
                Err(e) => {
                    warn!("Failed to await pipeline: {}", e);
                    RawOutcome::WaitFailed
                }
            },
            _ = &mut deadline => {
                self.terminate_tree(child, pid).await;
                RawOutcome::Deadline
            }
            Some(breach) = breach_rx.recv() => {
                warn!("Terminating pid {}: {}", pid, breach);
                self.terminate_tree(child, pid).await;
                RawOutcome::Breach(breach)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        (raw, stdout, stderr)
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    async fn terminate_tree(&self, child: &mut Child, pid: u32) {
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("SIGTERM to group {} failed: {}", pid, e);
        }

        match tokio::time::timeout(self.process.grace(), child.wait()).await {
            Ok(_) => debug!("Pipeline {} exited within grace period", pid),
            Err(_) => {
                warn!("Pipeline {} ignored SIGTERM, escalating to SIGKILL", pid);
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    debug!("SIGKILL to group {} failed: {}", pid, e);
                }
                let _ = child.wait().await;
            }
        }
    }
}

enum RawOutcome {
    Exited(std::process::ExitStatus),
    Deadline,
    Breach(ResourceBreach),
    WaitFailed,
}

/// Pick the monitoring source for a run.
///
/// Container pipelines hang off the runtime's shim, so their host-side
/// client pid tells the /proc walker nothing; the runtime accounts for them
/// instead. Everything else is a host process tree.
fn monitor_target(handle: &SandboxHandle, pid: u32) -> MonitorTarget {
    match &handle.kind {
        SandboxKind::Container { name } => MonitorTarget::Container { name: name.clone() },
        SandboxKind::Chroot { .. } => MonitorTarget::Tree { pid },
    }
}

/// Map the supervision race result onto the run's terminal state.
fn map_outcome(
    raw: RawOutcome,
    pid: u32,
    deadline_seconds: u64,
    stdout: String,
    stderr: String,
) -> ProcessOutcome {
    match raw {
        RawOutcome::Exited(status) if status.success() => ProcessOutcome::Completed { stdout },
        RawOutcome::Exited(status) => ProcessOutcome::Crashed {
            exit_code: status.code(),
            stderr,
        },
        RawOutcome::Deadline => {
            audit().log(AuditEvent::PipelineTerminated {
                pid,
                cause: "timeout".to_string(),
            });
            ProcessOutcome::TimedOut {
                seconds: deadline_seconds,
            }
        }
        RawOutcome::Breach(breach) => {
            audit().log(AuditEvent::PipelineTerminated {
                pid,
                cause: breach.kind().to_string(),
            });
            ProcessOutcome::ResourceExceeded { breach }
        }
        // Losing track of the child is not a deadline; report it as an
        // abnormal end so the caller does not see a fabricated timeout.
        RawOutcome::WaitFailed => ProcessOutcome::Crashed {
            exit_code: None,
            stderr,
        },
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buffer = String::new();
    let _ = pipe.read_to_string(&mut buffer).await;
    buffer
}

/// Recover the transcript text the pipeline wrote into the output dir.
///
/// Looks for `<stem>.txt` first, then falls back to the first `.txt` file,
/// since some pipeline versions normalize the stem.
async fn collect_transcript(output_dir: &Path, input_name: &str) -> Option<String> {
    let stem = Path::new(input_name).file_stem()?.to_str()?;
    let preferred = output_dir.join(format!("{}.txt", stem));
    if let Ok(text) = tokio::fs::read_to_string(&preferred).await {
        return Some(text);
    }

    let mut entries = tokio::fs::read_dir(output_dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "txt") {
            return tokio::fs::read_to_string(&path).await.ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn manager(process: ProcessConfig) -> ProcessManager {
        let config = SecurityConfig::default();
        ProcessManager::new(process, config.monitor, Arc::new(ProcessRegistry::new()))
    }

    #[test]
    fn test_command_expansion() {
        let m = manager(ProcessConfig::default());
        let argv = m.expand_command("/workspace/call.mp3", "/workspace/out");
        assert_eq!(argv[0], "whisper");
        assert!(argv.contains(&"/workspace/call.mp3".to_string()));
        assert!(argv.contains(&"/workspace/out".to_string()));
        assert!(!argv.iter().any(|a| a.contains('{')));
    }

    #[test]
    fn test_monitor_target_follows_strategy() {
        let limits = ResourceLimits {
            memory_mb: 512,
            cpu_percent: 80,
        };
        let mut container = SandboxHandle::new(
            uuid::Uuid::new_v4(),
            SandboxKind::Container {
                name: "audio-gate-test".to_string(),
            },
            limits,
            tempfile::TempDir::new().unwrap(),
        );
        assert!(matches!(
            monitor_target(&container, 42),
            MonitorTarget::Container { ref name } if name == "audio-gate-test"
        ));
        container.mark_closed();

        let workspace = tempfile::TempDir::new().unwrap();
        let root = workspace.path().to_path_buf();
        let mut chroot = SandboxHandle::new(
            uuid::Uuid::new_v4(),
            SandboxKind::Chroot { root },
            limits,
            workspace,
        );
        assert!(matches!(
            monitor_target(&chroot, 42),
            MonitorTarget::Tree { pid: 42 }
        ));
        chroot.mark_closed();
    }

    #[test]
    fn test_wait_failure_is_a_crash_not_a_timeout() {
        let outcome = map_outcome(
            RawOutcome::WaitFailed,
            1,
            3600,
            String::new(),
            "lost the child".to_string(),
        );
        match outcome {
            ProcessOutcome::Crashed { exit_code, stderr } => {
                assert_eq!(exit_code, None);
                assert_eq!(stderr, "lost the child");
            }
            other => panic!("expected Crashed, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_statuses_map_by_code() {
        use std::os::unix::process::ExitStatusExt;

        let ok = map_outcome(
            RawOutcome::Exited(std::process::ExitStatus::from_raw(0)),
            1,
            3600,
            "transcript".to_string(),
            String::new(),
        );
        assert!(matches!(ok, ProcessOutcome::Completed { ref stdout } if stdout == "transcript"));

        // Exit code 3 is wait-status 3 << 8.
        let crashed = map_outcome(
            RawOutcome::Exited(std::process::ExitStatus::from_raw(3 << 8)),
            1,
            3600,
            String::new(),
            String::new(),
        );
        assert!(matches!(
            crashed,
            ProcessOutcome::Crashed {
                exit_code: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            ProcessOutcome::TimedOut { seconds: 1 }.label(),
            "timed_out"
        );
        assert_eq!(
            ProcessOutcome::Crashed {
                exit_code: Some(1),
                stderr: String::new()
            }
            .label(),
            "crashed"
        );
    }

    #[tokio::test]
    async fn test_collect_transcript_prefers_matching_stem() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("call.txt"), "expected")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("other.txt"), "fallback")
            .await
            .unwrap();
        let text = collect_transcript(dir.path(), "call.mp3").await;
        assert_eq!(text.as_deref(), Some("expected"));
    }

    #[tokio::test]
    async fn test_collect_transcript_falls_back_to_any_txt() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("normalized.txt"), "fallback")
            .await
            .unwrap();
        let text = collect_transcript(dir.path(), "call.mp3").await;
        assert_eq!(text.as_deref(), Some("fallback"));
    }

    #[tokio::test]
    async fn test_collect_transcript_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_transcript(dir.path(), "call.mp3").await.is_none());
    }
}
