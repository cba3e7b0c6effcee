//! The orchestrator tying every security layer together.
//!
//! [`SecurityProcessor::process_file`] drives one artifact through the full
//! pipeline: static validation, admission control, sandboxed execution under
//! supervision, injection scanning of the transcript, downstream analysis
//! with the response scanned and validated in turn, and atomic persistence.
//! Each phase either
//! advances the run or terminates it; nothing is persisted for a run that
//! fails any phase, and capacity and sandboxes release on every path.

mod admission;
mod persist;

pub use admission::{AdmissionController, AdmissionSlot};
pub use persist::{
    persist_run, RunArtifacts, SecurityMetadata, ANALYSIS_FILE, SECURITY_FILE, TRANSCRIPT_FILE,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::error::{GatewayError, Result};
use crate::injection::{validate_response, PromptInjectionDetector};
use crate::monitor::{ProcessRegistry, ReaperHandle};
use crate::process::{ProcessManager, ProcessOutcome};
use crate::sandbox::{ResourceLimits, Sandbox, SandboxError};
use crate::telemetry::{audit, AuditEvent};
use crate::validate::{FileValidator, ValidationResult};

/// Downstream collaborator that analyzes a sanitized transcript.
///
/// Implementations receive the transcript already sanitized and wrapped in
/// the safety preamble, and return their raw response; the gateway
/// validates the response shape itself.
pub trait TranscriptAnalyzer: Send + Sync {
    /// Analyze a prepared transcript and return the raw response.
    fn analyze(
        &self,
        prompt: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Placeholder analyzer used when no downstream service is wired in.
///
/// Returns a conforming no-alert response so the rest of the pipeline,
/// including response validation and persistence, runs unchanged.
pub struct PassthroughAnalyzer;

impl TranscriptAnalyzer for PassthroughAnalyzer {
    async fn analyze(&self, _prompt: &str) -> Result<String> {
        Ok(r#"{"alert": false, "summary": "analysis not configured"}"#.to_string())
    }
}

/// Report for one successfully completed run.
#[derive(Debug)]
pub struct RunReport {
    /// Input file.
    pub file: PathBuf,
    /// Run identifier.
    pub run_id: Uuid,
    /// Directory the artifacts were published to.
    pub output_dir: PathBuf,
    /// Whether the analysis raised an alert (None when non-conforming).
    pub alert: Option<bool>,
    /// Ids of injection signatures that matched below threshold.
    pub suspicious_patterns: Vec<String>,
    /// Wall-clock processing time in milliseconds.
    pub processing_time_ms: u64,
}

/// One entry of a batch run.
#[derive(Debug)]
pub struct BatchEntry {
    /// Input file.
    pub file: PathBuf,
    /// Terminal result for this file.
    pub result: Result<RunReport>,
}

/// Summary of a batch run.
#[derive(Debug)]
pub struct BatchReport {
    /// Per-file results, in completion order.
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    /// Number of files in the batch.
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    /// Number of files that completed and persisted.
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.result.is_ok()).count()
    }

    /// Number of files turned away by policy (validation, admission,
    /// injection threshold).
    pub fn rejected(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.result,
                    Err(GatewayError::Validation(_)
                        | GatewayError::AdmissionRejected { .. }
                        | GatewayError::InjectionThresholdExceeded { .. })
                )
            })
            .count()
    }

    /// Number of files that failed for any other reason.
    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded() - self.rejected()
    }
}

/// The secure execution gateway.
pub struct SecurityProcessor<S: Sandbox, A: TranscriptAnalyzer> {
    config: Arc<SecurityConfig>,
    validator: FileValidator,
    detector: PromptInjectionDetector,
    admission: AdmissionController,
    manager: ProcessManager,
    sandbox: S,
    analyzer: A,
    _reaper: ReaperHandle,
}

impl<S: Sandbox, A: TranscriptAnalyzer> SecurityProcessor<S, A> {
    /// Assemble the gateway from a configuration snapshot.
    pub fn new(config: Arc<SecurityConfig>, sandbox: S, analyzer: A) -> Result<Self> {
        let registry = Arc::new(ProcessRegistry::new());
        // Backstop behind the per-run supervisors; generous ceiling so it
        // only ever fires on trees whose supervisor is gone.
        let reaper = registry.spawn_reaper(
            std::time::Duration::from_secs(30),
            config.process.deadline() + config.process.grace() * 4,
        );
        Ok(Self {
            validator: FileValidator::new(config.clone()),
            detector: PromptInjectionDetector::new(config.injection.clone())?,
            admission: AdmissionController::new(&config.admission),
            manager: ProcessManager::new(
                config.process.clone(),
                config.monitor.clone(),
                registry,
            ),
            sandbox,
            analyzer,
            config,
            _reaper: reaper,
        })
    }

    /// Drive one file through the full pipeline.
    pub async fn process_file(&self, path: &Path) -> Result<RunReport> {
        let started = Instant::now();
        let file_name = display_name(path);
        let run_id = Uuid::new_v4();

        let result = self.run_pipeline(path, run_id, &file_name, started).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(
                GatewayError::Validation(_)
                | GatewayError::AdmissionRejected { .. }
                | GatewayError::InjectionThresholdExceeded { .. },
            ) => "rejected",
            Err(_) => "failed",
        };
        audit().log(AuditEvent::RunFinished {
            file: file_name,
            outcome: outcome.to_string(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        });
        result
    }

    async fn run_pipeline(
        &self,
        path: &Path,
        run_id: Uuid,
        file_name: &str,
        started: Instant,
    ) -> Result<RunReport> {
        // Phase 1: static validation, before any capacity is consumed.
        let validation = self.validator.validate(path).await;
        if !validation.is_valid {
            let reason = validation
                .reason
                .unwrap_or_else(|| "validation failed".to_string());
            audit().log(AuditEvent::ValidationRejected {
                file: file_name.to_string(),
                reason: reason.clone(),
            });
            return Err(GatewayError::Validation(reason));
        }

        // Phase 2: admission. The slot is held until this function returns.
        let _slot = match self.admission.admit().await {
            Ok(slot) => slot,
            Err(e) => {
                audit().log(AuditEvent::AdmissionRejected {
                    file: file_name.to_string(),
                });
                return Err(e);
            }
        };
        audit().log(AuditEvent::RunAdmitted {
            file: file_name.to_string(),
            checksum: validation.checksum.clone(),
        });
        info!(run_id = %run_id, file = file_name, "Run admitted");

        // Phase 3: sandboxed execution under supervision.
        let limits = ResourceLimits {
            memory_mb: self.config.monitor.max_memory_mb,
            cpu_percent: self.config.monitor.max_cpu_percent,
        };
        let run = self
            .manager
            .execute(&self.sandbox, limits, run_id, path)
            .await
            .map_err(|e| match e {
                GatewayError::Sandbox(SandboxError::RuntimeUnavailable(message)) => {
                    GatewayError::SandboxUnavailable(message)
                }
                other => other,
            })?;

        let transcript = match run.outcome {
            ProcessOutcome::Completed { stdout } => run.transcript.unwrap_or(stdout),
            ProcessOutcome::TimedOut { seconds } => {
                return Err(GatewayError::TimedOut { seconds });
            }
            ProcessOutcome::ResourceExceeded { breach } => {
                return Err(GatewayError::ResourceExceeded(breach.to_string()));
            }
            ProcessOutcome::Crashed { exit_code, stderr } => {
                warn!(run_id = %run_id, ?exit_code, stderr, "Pipeline crashed");
                return Err(GatewayError::Crashed { exit_code });
            }
        };

        // Phase 4: injection scan of the untrusted transcript.
        let finding = self.detector.scan(&transcript);
        if !finding.matched_patterns.is_empty() {
            audit().log(AuditEvent::InjectionDetected {
                file: file_name.to_string(),
                patterns: finding.matched_ids(),
                rejected: finding.is_suspicious,
            });
        }
        if finding.is_suspicious {
            return Err(GatewayError::InjectionThresholdExceeded {
                matched: self.detector.counted_matches(&finding),
                limit: self.detector.threshold(),
            });
        }

        // Phase 5: downstream analysis over the sanitized transcript. The
        // response is untrusted too: an analyzer hijacked by transcript
        // content can echo injection text, so it gets the same scan before
        // anything of it is trusted or persisted.
        let prompt = self.detector.with_safety_preamble(&finding.sanitized_text);
        let raw_analysis = self.analyzer.analyze(&prompt).await?;
        let response_finding = self.detector.scan(&raw_analysis);
        if !response_finding.matched_patterns.is_empty() {
            audit().log(AuditEvent::InjectionDetected {
                file: file_name.to_string(),
                patterns: response_finding.matched_ids(),
                rejected: response_finding.is_suspicious,
            });
        }
        if response_finding.is_suspicious {
            return Err(GatewayError::InjectionThresholdExceeded {
                matched: self.detector.counted_matches(&response_finding),
                limit: self.detector.threshold(),
            });
        }
        let (alert, conforming) = match validate_response(&raw_analysis) {
            Ok(alert) => (Some(alert), true),
            Err(reason) => {
                warn!(run_id = %run_id, reason, "Analysis response non-conforming");
                audit().log(AuditEvent::AnalysisNonConforming {
                    file: file_name.to_string(),
                });
                (None, false)
            }
        };

        // Phase 6: atomic persistence.
        let mut suspicious_patterns = finding.matched_ids();
        for id in response_finding.matched_ids() {
            if !suspicious_patterns.contains(&id) {
                suspicious_patterns.push(id);
            }
        }
        let metadata = SecurityMetadata {
            file: file_name.to_string(),
            checksum: validation.checksum,
            size_bytes: validation.size_bytes,
            duration_seconds: validation.duration_seconds,
            sandbox_kind: run.sandbox_kind,
            suspicious_patterns,
            alert,
            analysis_conforming: conforming,
            resource_usage: run.usage,
            processing_time_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };
        let stem = output_stem(path);
        let output_dir = persist_run(
            &self.config.output.output_dir,
            &stem,
            RunArtifacts {
                transcript: &finding.sanitized_text,
                analysis: &response_finding.sanitized_text,
                metadata: &metadata,
            },
        )
        .await?;

        Ok(RunReport {
            file: path.to_path_buf(),
            run_id,
            output_dir,
            alert,
            suspicious_patterns: metadata.suspicious_patterns,
            processing_time_ms: metadata.processing_time_ms,
        })
    }

    /// Re-run validation only, without consuming capacity. Diagnostics.
    pub async fn validate_only(&self, path: &Path) -> ValidationResult {
        self.validator.validate(path).await
    }
}

impl<S, A> SecurityProcessor<S, A>
where
    S: Sandbox + 'static,
    A: TranscriptAnalyzer + 'static,
{
    /// Process a batch of files concurrently.
    ///
    /// All files share one admission pool, so at most
    /// `admission.max_concurrent_processes` sandboxes exist at any moment
    /// regardless of batch size.
    pub async fn process_batch(self: Arc<Self>, files: Vec<PathBuf>) -> BatchReport {
        let mut tasks = JoinSet::new();
        for file in files {
            let gateway = self.clone();
            tasks.spawn(async move {
                let result = gateway.process_file(&file).await;
                BatchEntry { file, result }
            });
        }

        let mut entries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Batch task panicked: {}", e),
            }
        }
        BatchReport { entries }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn output_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string())
}
