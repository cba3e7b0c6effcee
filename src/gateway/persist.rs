//! Atomic persistence of run artifacts.
//!
//! A run publishes three files: the sanitized transcript, the raw analysis
//! response, and the security metadata describing how the run went. All
//! three are written into a hidden staging directory and published with one
//! directory rename, so an observer of the output root either sees a
//! complete result set or nothing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayError;
use crate::monitor::ResourceUsageSummary;

/// Published transcript file name.
pub const TRANSCRIPT_FILE: &str = "transcript.txt";
/// Published analysis response file name.
pub const ANALYSIS_FILE: &str = "analysis.json";
/// Published security metadata file name.
pub const SECURITY_FILE: &str = "security.json";

/// Security metadata persisted alongside every successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityMetadata {
    /// Original file name.
    pub file: String,
    /// SHA-256 of the validated input, lowercase hex.
    pub checksum: String,
    /// Input size in bytes.
    pub size_bytes: u64,
    /// Probed audio duration, when available.
    pub duration_seconds: Option<f64>,
    /// Isolation strategy that hosted the run ("container" or "chroot").
    pub sandbox_kind: String,
    /// Ids of injection signatures that matched (all below threshold,
    /// or the run would have been rejected).
    pub suspicious_patterns: Vec<String>,
    /// Verdict extracted from a conforming analysis response.
    pub alert: Option<bool>,
    /// Whether the analysis response conformed to the expected shape.
    pub analysis_conforming: bool,
    /// Peak resource usage of the pipeline.
    pub resource_usage: ResourceUsageSummary,
    /// Wall-clock processing time in milliseconds.
    pub processing_time_ms: u64,
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
}

/// Artifacts of one completed run, ready to publish.
#[derive(Debug)]
pub struct RunArtifacts<'a> {
    /// Sanitized transcript text.
    pub transcript: &'a str,
    /// Raw analysis response as returned by the collaborator.
    pub analysis: &'a str,
    /// Security metadata.
    pub metadata: &'a SecurityMetadata,
}

/// Publish run artifacts under `<output_root>/<stem>/`.
///
/// Returns the published directory. When a directory for the stem already
/// exists a numeric suffix is appended rather than overwriting earlier
/// results.
pub async fn persist_run(
    output_root: &Path,
    stem: &str,
    artifacts: RunArtifacts<'_>,
) -> Result<PathBuf, GatewayError> {
    tokio::fs::create_dir_all(output_root)
        .await
        .map_err(GatewayError::Persist)?;

    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(output_root)
        .map_err(GatewayError::Persist)?;

    tokio::fs::write(staging.path().join(TRANSCRIPT_FILE), artifacts.transcript)
        .await
        .map_err(GatewayError::Persist)?;
    tokio::fs::write(staging.path().join(ANALYSIS_FILE), artifacts.analysis)
        .await
        .map_err(GatewayError::Persist)?;
    let metadata_json =
        serde_json::to_vec_pretty(artifacts.metadata).map_err(|e| {
            GatewayError::Persist(std::io::Error::other(e))
        })?;
    tokio::fs::write(staging.path().join(SECURITY_FILE), metadata_json)
        .await
        .map_err(GatewayError::Persist)?;

    let target = unique_target(output_root, stem).await;
    let staged_path = staging.keep();
    tokio::fs::rename(&staged_path, &target).await.map_err(|e| {
        // Publication failed; remove the orphaned staging directory.
        let _ = std::fs::remove_dir_all(&staged_path);
        GatewayError::Persist(e)
    })?;

    debug!("Published run artifacts to {:?}", target);
    Ok(target)
}

/// First free directory name for the stem.
async fn unique_target(output_root: &Path, stem: &str) -> PathBuf {
    let base = output_root.join(stem);
    if tokio::fs::metadata(&base).await.is_err() {
        return base;
    }
    for n in 1u32.. {
        let candidate = output_root.join(format!("{}-{}", stem, n));
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!("u32 suffix space exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SecurityMetadata {
        SecurityMetadata {
            file: "call.mp3".to_string(),
            checksum: "abc123".to_string(),
            size_bytes: 1024,
            duration_seconds: Some(61.5),
            sandbox_kind: "container".to_string(),
            suspicious_patterns: vec!["system-prompt-en".to_string()],
            alert: Some(false),
            analysis_conforming: true,
            resource_usage: ResourceUsageSummary::default(),
            processing_time_ms: 4230,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_persist_publishes_all_three_files() {
        let root = tempfile::tempdir().unwrap();
        let meta = metadata();
        let published = persist_run(
            root.path(),
            "call",
            RunArtifacts {
                transcript: "hello world",
                analysis: r#"{"alert": false}"#,
                metadata: &meta,
            },
        )
        .await
        .unwrap();

        assert_eq!(published, root.path().join("call"));
        assert_eq!(
            std::fs::read_to_string(published.join(TRANSCRIPT_FILE)).unwrap(),
            "hello world"
        );
        let security: SecurityMetadata = serde_json::from_slice(
            &std::fs::read(published.join(SECURITY_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(security.checksum, "abc123");
        assert_eq!(security.alert, Some(false));
    }

    #[tokio::test]
    async fn test_no_staging_residue_after_publish() {
        let root = tempfile::tempdir().unwrap();
        let meta = metadata();
        persist_run(
            root.path(),
            "call",
            RunArtifacts {
                transcript: "t",
                analysis: "{}",
                metadata: &meta,
            },
        )
        .await
        .unwrap();

        let residue: Vec<_> = std::fs::read_dir(root.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
            .collect();
        assert!(residue.is_empty());
    }

    #[tokio::test]
    async fn test_existing_results_not_overwritten() {
        let root = tempfile::tempdir().unwrap();
        let meta = metadata();
        let first = persist_run(
            root.path(),
            "call",
            RunArtifacts {
                transcript: "first",
                analysis: "{}",
                metadata: &meta,
            },
        )
        .await
        .unwrap();
        let second = persist_run(
            root.path(),
            "call",
            RunArtifacts {
                transcript: "second",
                analysis: "{}",
                metadata: &meta,
            },
        )
        .await
        .unwrap();

        assert_ne!(first, second);
        assert_eq!(
            std::fs::read_to_string(first.join(TRANSCRIPT_FILE)).unwrap(),
            "first"
        );
        assert_eq!(
            std::fs::read_to_string(second.join(TRANSCRIPT_FILE)).unwrap(),
            "second"
        );
    }
}
