//! audio-gate: Secure execution gateway for untrusted audio pipelines
//!
//! This crate wraps a multi-stage audio processing pipeline (decoding,
//! transcription, speaker separation, LLM content analysis) in a trust
//! boundary. The pipeline stages themselves are external collaborators;
//! audio-gate owns everything around them:
//!
//! - **Validate**: format/size/duration/checksum admission checks before any
//!   processor touches the file
//! - **Sandbox**: disposable container or chroot isolation with guaranteed
//!   teardown on every exit path
//! - **Monitor**: /proc-based CPU and memory supervision over the whole
//!   process tree, with cooperative preemption
//! - **Injection**: prompt-injection detection over the transcript with a
//!   sanitize-then-forward contract toward the analysis LLM
//! - **Fetch**: host-allowlisted SFTP/FTP retrieval with checksum enforcement
//! - **Gateway**: the admission-controlled orchestrator that sequences all of
//!   the above
//!
//! # Security Model
//!
//! The security model is **fail-closed**: when in doubt, deny and log. A file
//! that cannot be validated is rejected; a sandbox that cannot be created
//! rejects the run rather than executing unsandboxed; a transcript that trips
//! the injection threshold is discarded, never persisted.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod injection;
pub mod monitor;
pub mod process;
pub mod sandbox;
pub mod telemetry;
pub mod validate;
