//! Configuration schema definitions.
//!
//! [`SecurityConfig`] holds every limit and feature toggle the gateway
//! recognizes. Defaults mirror the shipped `config/default.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;

/// Top-level configuration snapshot.
///
/// Created once at startup and shared immutably (`Arc`) with all components.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// File admission limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Admission-control pool settings.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Sandbox strategy selection.
    #[serde(default)]
    pub sandbox: SandboxStrategyConfig,

    /// Remote fetch policy.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Prompt-injection detection policy.
    #[serde(default)]
    pub injection: InjectionConfig,

    /// Resource monitoring thresholds.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Supervised process settings.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Persisted output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

impl SecurityConfig {
    /// Merge another config into this one.
    ///
    /// Lists are merged (appended). Scalars are overridden when non-default.
    pub fn merge(&mut self, other: SecurityConfig) {
        self.general.merge(other.general);
        self.limits.merge(other.limits);
        self.admission.merge(other.admission);
        self.sandbox.merge(other.sandbox);
        self.fetch.merge(other.fetch);
        self.injection.merge(other.injection);
        self.monitor.merge(other.monitor);
        self.process.merge(other.process);
        self.output.merge(other.output);
    }

    /// Validate cross-field constraints. Fails fast with the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_concurrent_processes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "admission.max_concurrent_processes",
                message: "must be at least 1".to_string(),
            });
        }
        if self.limits.max_file_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                key: "limits.max_file_size_mb",
                message: "must be at least 1".to_string(),
            });
        }
        if !(self.limits.max_audio_duration_hours > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "limits.max_audio_duration_hours",
                message: "must be positive".to_string(),
            });
        }
        if self.monitor.max_cpu_percent > 100 * num_cpus_guess() {
            return Err(ConfigError::InvalidValue {
                key: "monitor.max_cpu_percent",
                message: format!(
                    "exceeds {}% (100% per logical CPU)",
                    100 * num_cpus_guess()
                ),
            });
        }
        if self.process.transcribe_command.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "process.transcribe_command",
                message: "must name the pipeline command".to_string(),
            });
        }
        Ok(())
    }
}

fn num_cpus_guess() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// File admission limits enforced by the validator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Maximum file size in megabytes.
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// Maximum probed audio duration in hours.
    #[serde(default = "default_max_audio_duration_hours")]
    pub max_audio_duration_hours: f64,
}

fn default_max_file_size_mb() -> u64 {
    200
}

fn default_max_audio_duration_hours() -> f64 {
    2.0
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            max_audio_duration_hours: default_max_audio_duration_hours(),
        }
    }
}

impl LimitsConfig {
    fn merge(&mut self, other: LimitsConfig) {
        if other.max_file_size_mb != default_max_file_size_mb() {
            self.max_file_size_mb = other.max_file_size_mb;
        }
        if other.max_audio_duration_hours != default_max_audio_duration_hours() {
            self.max_audio_duration_hours = other.max_audio_duration_hours;
        }
    }

    /// Size ceiling in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Duration ceiling in seconds.
    pub fn max_duration_seconds(&self) -> f64 {
        self.max_audio_duration_hours * 3600.0
    }
}

/// Admission-control pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// Maximum number of concurrently sandboxed runs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_processes: usize,

    /// Maximum number of requests allowed to wait for a slot.
    ///
    /// Requests arriving beyond `max_concurrent_processes + max_queue_depth`
    /// are rejected immediately instead of queued.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_queue_depth() -> usize {
    16
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_processes: default_max_concurrent(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl AdmissionConfig {
    fn merge(&mut self, other: AdmissionConfig) {
        if other.max_concurrent_processes != default_max_concurrent() {
            self.max_concurrent_processes = other.max_concurrent_processes;
        }
        if other.max_queue_depth != default_max_queue_depth() {
            self.max_queue_depth = other.max_queue_depth;
        }
    }
}

/// Sandbox strategy selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxStrategyConfig {
    /// Use disposable Docker containers for isolation.
    #[serde(default = "default_true")]
    pub use_docker_sandbox: bool,

    /// Pinned base image for the container strategy.
    #[serde(default = "default_docker_image")]
    pub docker_image: String,

    /// Fall back to chroot-based filesystem isolation when the container
    /// runtime is unavailable (or use it as the primary strategy when
    /// `use_docker_sandbox` is false).
    #[serde(default)]
    pub use_chroot: bool,

    /// Root directory for chroot workspaces.
    #[serde(default = "default_chroot_dir")]
    pub chroot_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_docker_image() -> String {
    "python:3.10-slim".to_string()
}

fn default_chroot_dir() -> PathBuf {
    PathBuf::from("/var/lib/audio-gate/sandbox")
}

impl Default for SandboxStrategyConfig {
    fn default() -> Self {
        Self {
            use_docker_sandbox: true,
            docker_image: default_docker_image(),
            use_chroot: false,
            chroot_dir: default_chroot_dir(),
        }
    }
}

impl SandboxStrategyConfig {
    fn merge(&mut self, other: SandboxStrategyConfig) {
        // Booleans cannot distinguish "unset" from "default"; later config
        // wins unconditionally for strategy toggles.
        self.use_docker_sandbox = other.use_docker_sandbox;
        self.use_chroot = other.use_chroot;
        if other.docker_image != default_docker_image() {
            self.docker_image = other.docker_image;
        }
        if other.chroot_dir != default_chroot_dir() {
            self.chroot_dir = other.chroot_dir;
        }
    }
}

/// Remote fetch policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchConfig {
    /// Hosts the fetch client may contact. Empty means fetch is disabled.
    #[serde(default = "default_ftp_hosts")]
    pub allowed_ftp_hosts: Vec<String>,

    /// Enforce a checksum match after every fetch when an expected digest
    /// is supplied.
    #[serde(default = "default_true")]
    pub require_file_checksum: bool,

    /// Permit the plaintext FTP protocol (read-only, non-anonymous).
    ///
    /// SFTP is always preferred; this toggle only unlocks the legacy
    /// fallback.
    #[serde(default)]
    pub allow_plaintext_ftp: bool,
}

fn default_ftp_hosts() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allowed_ftp_hosts: default_ftp_hosts(),
            require_file_checksum: true,
            allow_plaintext_ftp: false,
        }
    }
}

impl FetchConfig {
    fn merge(&mut self, other: FetchConfig) {
        if other.allowed_ftp_hosts != default_ftp_hosts() {
            // Append semantics with set behavior: a host listed by several
            // layers still appears once.
            for host in other.allowed_ftp_hosts {
                if !self.allowed_ftp_hosts.contains(&host) {
                    self.allowed_ftp_hosts.push(host);
                }
            }
        }
        self.require_file_checksum = other.require_file_checksum;
        self.allow_plaintext_ftp = other.allow_plaintext_ftp;
    }
}

/// Prompt-injection detection policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InjectionConfig {
    /// Toggle the detector entirely.
    #[serde(default = "default_true")]
    pub enable_prompt_injection_detection: bool,

    /// Reject the run when at least this many distinct counted patterns
    /// match the transcript.
    #[serde(default = "default_max_suspicious")]
    pub max_suspicious_patterns: usize,

    /// Count `Advisory` severity signatures toward the rejection threshold
    /// in addition to `Blocking` ones.
    #[serde(default)]
    pub count_advisory_patterns: bool,

    /// Deployment-specific signatures added to the builtin set.
    ///
    /// Each entry is a regular expression, compiled case-insensitively and
    /// treated as `Blocking` severity.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_max_suspicious() -> usize {
    3
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enable_prompt_injection_detection: true,
            max_suspicious_patterns: default_max_suspicious(),
            count_advisory_patterns: false,
            extra_patterns: Vec::new(),
        }
    }
}

impl InjectionConfig {
    fn merge(&mut self, other: InjectionConfig) {
        self.enable_prompt_injection_detection = other.enable_prompt_injection_detection;
        if other.max_suspicious_patterns != default_max_suspicious() {
            self.max_suspicious_patterns = other.max_suspicious_patterns;
        }
        self.count_advisory_patterns = other.count_advisory_patterns;
        self.extra_patterns.extend(other.extra_patterns);
    }
}

/// Resource monitoring thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Toggle per-run resource monitoring.
    #[serde(default = "default_true")]
    pub enable_resource_monitoring: bool,

    /// Resident memory ceiling for the supervised process tree, in MB.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// CPU ceiling for the supervised process tree, in percent of one core.
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: u32,

    /// Sampling cadence in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_max_memory_mb() -> u64 {
    2048
}

fn default_max_cpu_percent() -> u32 {
    80
}

fn default_sample_interval_ms() -> u64 {
    1000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable_resource_monitoring: true,
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

impl MonitorConfig {
    fn merge(&mut self, other: MonitorConfig) {
        self.enable_resource_monitoring = other.enable_resource_monitoring;
        if other.max_memory_mb != default_max_memory_mb() {
            self.max_memory_mb = other.max_memory_mb;
        }
        if other.max_cpu_percent != default_max_cpu_percent() {
            self.max_cpu_percent = other.max_cpu_percent;
        }
        if other.sample_interval_ms != default_sample_interval_ms() {
            self.sample_interval_ms = other.sample_interval_ms;
        }
    }

    /// Sampling cadence as a [`Duration`].
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(100))
    }
}

/// Supervised process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    /// Wall-clock deadline for one pipeline invocation, in seconds.
    #[serde(default = "default_max_transcription_time")]
    pub max_transcription_time_seconds: u64,

    /// Grace period between SIGTERM and SIGKILL, in seconds.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,

    /// Pipeline command template. `{input}` expands to the validated file
    /// path inside the sandbox workspace and `{output_dir}` to the workspace
    /// output directory.
    #[serde(default = "default_transcribe_command")]
    pub transcribe_command: Vec<String>,
}

fn default_max_transcription_time() -> u64 {
    3600
}

fn default_grace_period() -> u64 {
    5
}

fn default_transcribe_command() -> Vec<String> {
    vec![
        "whisper".to_string(),
        "{input}".to_string(),
        "--model".to_string(),
        "large-v3".to_string(),
        "--output_format".to_string(),
        "txt".to_string(),
        "--output_dir".to_string(),
        "{output_dir}".to_string(),
    ]
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_transcription_time_seconds: default_max_transcription_time(),
            grace_period_seconds: default_grace_period(),
            transcribe_command: default_transcribe_command(),
        }
    }
}

impl ProcessConfig {
    fn merge(&mut self, other: ProcessConfig) {
        if other.max_transcription_time_seconds != default_max_transcription_time() {
            self.max_transcription_time_seconds = other.max_transcription_time_seconds;
        }
        if other.grace_period_seconds != default_grace_period() {
            self.grace_period_seconds = other.grace_period_seconds;
        }
        if other.transcribe_command != default_transcribe_command() {
            self.transcribe_command = other.transcribe_command;
        }
    }

    /// Wall-clock deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.max_transcription_time_seconds)
    }

    /// TERM-to-KILL grace as a [`Duration`].
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

/// Persisted output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Root directory for persisted artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl OutputConfig {
    fn merge(&mut self, other: OutputConfig) {
        if other.output_dir != default_output_dir() {
            self.output_dir = other.output_dir;
        }
    }
}
