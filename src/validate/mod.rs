//! File validation: the static admission boundary.
//!
//! Every candidate file passes through [`FileValidator::validate`] before it
//! can consume an admission slot or touch a sandbox. Checks run in order and
//! short-circuit on the first failure:
//!
//! 1. Extension and sniffed magic bytes against the audio allow-list
//! 2. Size against `limits.max_file_size_mb`
//! 3. Probed duration against `limits.max_audio_duration_hours`
//!    (container metadata only - never a full decode)
//! 4. SHA-256 checksum over the full byte stream
//!
//! Validation runs directly on the host: it is the prerequisite for
//! trusting the file enough to isolate-and-run it, so it cannot itself
//! depend on the sandbox.

mod probe;
mod sniff;

pub use probe::probe_duration_seconds;
pub use sniff::{format_from_path, sniff_format, AudioFormat};

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::SecurityConfig;

/// Outcome of validating one candidate file.
///
/// Produced by [`FileValidator`], consumed immediately by the orchestrator,
/// and embedded into the persisted security metadata on success.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether the file passed every check.
    pub is_valid: bool,
    /// Human-readable reason for rejection. `None` when valid.
    pub reason: Option<String>,
    /// SHA-256 of the full byte stream, hex-encoded. Empty until the
    /// checksum step runs (rejections short-circuit before it).
    pub checksum: String,
    /// Detected audio format, when sniffing got that far.
    pub detected_format: Option<AudioFormat>,
    /// Probed duration in seconds, when probing got that far.
    pub duration_seconds: Option<f64>,
    /// File size in bytes.
    pub size_bytes: u64,
}

impl ValidationResult {
    fn rejected(reason: String, size_bytes: u64) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
            checksum: String::new(),
            detected_format: None,
            duration_seconds: None,
            size_bytes,
        }
    }
}

/// Static admission checks on a candidate file.
pub struct FileValidator {
    config: Arc<SecurityConfig>,
}

impl FileValidator {
    /// Create a validator bound to a configuration snapshot.
    pub fn new(config: Arc<SecurityConfig>) -> Self {
        Self { config }
    }

    /// Run all admission checks against `path`.
    ///
    /// Never returns an error: every failure mode folds into a rejected
    /// [`ValidationResult`] so the caller has one uniform decision point.
    /// No partial side effects are left behind.
    pub async fn validate(&self, path: &Path) -> ValidationResult {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                return ValidationResult::rejected(format!("cannot stat file: {}", e), 0);
            }
        };

        if !metadata.is_file() {
            return ValidationResult::rejected("not a regular file".to_string(), 0);
        }
        let size_bytes = metadata.len();

        // (a) extension + magic bytes against the allow-list
        let ext_format = match format_from_path(path) {
            Some(f) => f,
            None => {
                return ValidationResult::rejected(
                    format!(
                        "disallowed format: extension {:?} is not an allowed audio type",
                        path.extension().unwrap_or_default()
                    ),
                    size_bytes,
                );
            }
        };

        let header = match read_header(path).await {
            Ok(h) => h,
            Err(e) => {
                return ValidationResult::rejected(format!("cannot read file: {}", e), size_bytes);
            }
        };

        let sniffed = match sniff_format(&header) {
            Some(f) => f,
            None => {
                return ValidationResult::rejected(
                    "invalid MIME type: content does not match any allowed audio format"
                        .to_string(),
                    size_bytes,
                );
            }
        };

        if sniffed != ext_format {
            return ValidationResult::rejected(
                format!(
                    "invalid MIME type: extension says {} but content is {}",
                    ext_format.mime_type(),
                    sniffed.mime_type()
                ),
                size_bytes,
            );
        }

        // (b) size ceiling
        let max_bytes = self.config.limits.max_file_size_bytes();
        if size_bytes > max_bytes {
            return ValidationResult::rejected(
                format!(
                    "file too large: {:.1}MB > {}MB",
                    size_bytes as f64 / (1024.0 * 1024.0),
                    self.config.limits.max_file_size_mb
                ),
                size_bytes,
            );
        }

        // (c) duration ceiling (metadata probe only)
        let duration_seconds = probe_duration_seconds(path).await;
        if let Some(duration) = duration_seconds {
            let max_seconds = self.config.limits.max_duration_seconds();
            if duration > max_seconds {
                return ValidationResult::rejected(
                    format!(
                        "recording too long: {:.1}h > {}h",
                        duration / 3600.0,
                        self.config.limits.max_audio_duration_hours
                    ),
                    size_bytes,
                );
            }
        }

        // (d) checksum over the full byte stream
        let checksum = match checksum_file(path).await {
            Ok(c) => c,
            Err(e) => {
                return ValidationResult::rejected(
                    format!("checksum failed: {}", e),
                    size_bytes,
                );
            }
        };

        debug!(
            "Validated {:?}: format={}, size={}B, duration={:?}s",
            path, sniffed, size_bytes, duration_seconds
        );

        ValidationResult {
            is_valid: true,
            reason: None,
            checksum,
            detected_format: Some(sniffed),
            duration_seconds,
            size_bytes,
        }
    }
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = vec![0u8; 16];
    let n = file.read(&mut header).await?;
    header.truncate(n);
    Ok(header)
}

/// Compute the SHA-256 of a file, hex-encoded.
///
/// Streams in 64 KiB chunks on a blocking thread so large files never sit
/// in memory or stall the runtime.
pub async fn checksum_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex_encode(&hasher.finalize()))
    })
    .await
    .map_err(|e| std::io::Error::other(format!("checksum task panicked: {}", e)))?
}

/// Compute the SHA-256 of an in-memory buffer, hex-encoded.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
