//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Environment variable consulted for the fetch password, so credentials
/// never appear in the process list.
pub const FETCH_PASSWORD_ENV: &str = "AUDIO_GATE_FETCH_PASSWORD";

/// Secure execution gateway for untrusted audio artifacts.
#[derive(Debug, Parser)]
#[command(name = "audio-gate", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Extra configuration file, applied after system and user configs.
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Gateway subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate, sandbox-transcribe, scan and persist local audio files.
    Process {
        /// Audio files to process.
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Fetch a remote audio artifact through the policy gate.
    Fetch {
        /// Remote host; must be on the configured allowlist.
        #[arg(long)]
        host: String,

        /// Remote port; protocol default when omitted.
        #[arg(long)]
        port: Option<u16>,

        /// Login username.
        #[arg(long, short = 'u')]
        user: String,

        /// Path of the file on the remote side.
        #[arg(long, value_name = "PATH")]
        remote_path: String,

        /// Use plaintext FTP instead of SFTP. Requires
        /// `fetch.allow_plaintext_ftp` in configuration.
        #[arg(long)]
        plain_ftp: bool,

        /// Expected SHA-256 digest of the file, lowercase hex.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,

        /// Where to write the fetched file.
        #[arg(long, short = 'o', value_name = "PATH")]
        output: PathBuf,

        /// Immediately process the fetched file.
        #[arg(long)]
        process: bool,
    },

    /// Check that the host can actually isolate and supervise runs.
    Doctor,
}

impl Cli {
    /// Default tracing filter for the chosen verbosity.
    pub fn log_filter(&self, config_level: &str) -> String {
        let level = match self.verbose {
            0 if !config_level.is_empty() => config_level,
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        format!("audio_gate={},warn", level)
    }
}
