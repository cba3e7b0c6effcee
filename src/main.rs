//! Binary entry point for the audio-gate gateway.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use audio_gate::cli::{Cli, Command, FETCH_PASSWORD_ENV};
use audio_gate::config::{ConfigLoader, SecurityConfig};
use audio_gate::fetch::{FetchProtocol, FetchTarget, SecureFtpClient};
use audio_gate::gateway::{PassthroughAnalyzer, SecurityProcessor};
use audio_gate::sandbox::{cleanup, SandboxBackend};
use audio_gate::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfigLoader::new().load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("audio-gate: configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&cli, &config);
    if let Err(e) = telemetry::init_logger() {
        // Fallback already happened inside; this is only a double-init guard.
        error!("Audit logger init failed: {}", e);
    }

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("audio-gate: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cli: &Cli, config: &SecurityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter(&config.general.log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: Cli, config: SecurityConfig) -> anyhow::Result<ExitCode> {
    let config = Arc::new(config);
    match cli.command {
        Command::Process { files } => process_files(config, files).await,
        Command::Fetch {
            host,
            port,
            user,
            remote_path,
            plain_ftp,
            sha256,
            output,
            process,
        } => {
            let target = FetchTarget {
                protocol: if plain_ftp {
                    FetchProtocol::Ftp
                } else {
                    FetchProtocol::Sftp
                },
                host,
                port,
                username: user,
                password: std::env::var(FETCH_PASSWORD_ENV).with_context(|| {
                    format!("fetch password must be supplied via {}", FETCH_PASSWORD_ENV)
                })?,
                remote_path,
                expected_checksum: sha256,
            };

            let client = SecureFtpClient::new(config.fetch.clone());
            let artifact = client.fetch(target, &output).await?;
            println!(
                "Fetched {} ({} bytes, sha256 {})",
                artifact.local_path.display(),
                artifact.size_bytes,
                artifact.checksum
            );

            if process {
                return process_files(config, vec![output]).await;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Doctor => doctor(&config).await,
    }
}

async fn process_files(
    config: Arc<SecurityConfig>,
    files: Vec<std::path::PathBuf>,
) -> anyhow::Result<ExitCode> {
    cleanup::cleanup_stale_resources(&config.sandbox.chroot_dir).await;

    let backend = SandboxBackend::from_config(&config)
        .context("no usable isolation strategy; refusing to run unsandboxed")?;
    let gateway = Arc::new(SecurityProcessor::new(
        config,
        backend,
        PassthroughAnalyzer,
    )?);

    let total = files.len();
    let report = gateway.process_batch(files).await;
    for entry in &report.entries {
        match &entry.result {
            Ok(run) => println!(
                "{}: ok -> {} ({} ms{})",
                entry.file.display(),
                run.output_dir.display(),
                run.processing_time_ms,
                if run.suspicious_patterns.is_empty() {
                    String::new()
                } else {
                    format!(", {} signatures sanitized", run.suspicious_patterns.len())
                }
            ),
            Err(e) => println!("{}: {}", entry.file.display(), e),
        }
    }
    info!(
        total,
        succeeded = report.succeeded(),
        rejected = report.rejected(),
        failed = report.failed(),
        "Batch finished"
    );

    if report.succeeded() == total {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Preflight checks for the host's ability to isolate and supervise runs.
async fn doctor(config: &SecurityConfig) -> anyhow::Result<ExitCode> {
    let mut healthy = true;

    let docker_ok = command_succeeds("docker", &["version", "--format", "{{.Server.Version}}"])
        .await;
    report_check(
        "docker runtime",
        docker_ok,
        config.sandbox.use_docker_sandbox,
        &mut healthy,
    );

    let chroot_ok = nix::unistd::geteuid().is_root();
    report_check(
        "chroot privilege (root)",
        chroot_ok,
        config.sandbox.use_chroot && !config.sandbox.use_docker_sandbox,
        &mut healthy,
    );

    let ffprobe_ok = command_succeeds("ffprobe", &["-version"]).await;
    report_check("ffprobe (duration probing)", ffprobe_ok, false, &mut healthy);

    // Only meaningful outside the container strategy, where the pipeline
    // binary must exist on the host.
    if let Some(program) = config.process.transcribe_command.first() {
        let pipeline_ok =
            command_succeeds("sh", &["-c", &format!("command -v {}", program)]).await;
        report_check(
            &format!("pipeline command `{}` on host", program),
            pipeline_ok,
            false,
            &mut healthy,
        );
    }

    let output_ok = tokio::fs::create_dir_all(&config.output.output_dir)
        .await
        .is_ok()
        && is_writable(&config.output.output_dir);
    report_check("output directory writable", output_ok, true, &mut healthy);

    let stale = cleanup::list_stale_resources(&config.sandbox.chroot_dir).await;
    if stale.is_empty() {
        println!("  ok: no stale resources from crashed sessions");
    } else {
        println!(
            "warn: {} stale resources found (run `audio-gate process` to trigger cleanup)",
            stale.count()
        );
    }

    if healthy {
        println!("All required checks passed.");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Required checks failed; the gateway would refuse these runs.");
        Ok(ExitCode::FAILURE)
    }
}

fn report_check(name: &str, ok: bool, required: bool, healthy: &mut bool) {
    match (ok, required) {
        (true, _) => println!("  ok: {}", name),
        (false, true) => {
            println!("FAIL: {}", name);
            *healthy = false;
        }
        (false, false) => println!("warn: {} unavailable", name),
    }
}

async fn command_succeeds(program: &str, args: &[&str]) -> bool {
    tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

fn is_writable(dir: &Path) -> bool {
    tempfile::Builder::new()
        .prefix(".doctor-")
        .tempfile_in(dir)
        .is_ok()
}
