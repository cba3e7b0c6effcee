//! Policy-guarded retrieval of remote audio artifacts.
//!
//! # Security Model
//!
//! Fetching is the one place the gateway opens outbound connections, so
//! every transfer runs through a fixed policy gate before any socket is
//! opened: the host must be on the configured allowlist, credentials must
//! be real (no anonymous logins), and the plaintext FTP protocol is locked
//! behind an explicit opt-in. SFTP is the preferred transport.
//!
//! Fetched bytes are verified against their expected SHA-256 digest before
//! anything is written to disk, so a failed transfer can never leave an
//! unverified file where the validator might later admit it.

mod error;

pub use error::FetchError;

use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::FetchConfig;
use crate::telemetry::{audit, AuditEvent};
use crate::validate::checksum_bytes;

/// Transport protocol for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchProtocol {
    /// SFTP over SSH. Preferred.
    Sftp,
    /// Legacy plaintext FTP. Requires `fetch.allow_plaintext_ftp`.
    Ftp,
}

impl FetchProtocol {
    fn default_port(self) -> u16 {
        match self {
            Self::Sftp => 22,
            Self::Ftp => 21,
        }
    }
}

/// One remote artifact to fetch.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    /// Transport protocol.
    pub protocol: FetchProtocol,
    /// Remote host, matched verbatim against the allowlist.
    pub host: String,
    /// Remote port; protocol default when absent.
    pub port: Option<u16>,
    /// Login username.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Path of the file on the remote side.
    pub remote_path: String,
    /// Expected SHA-256 digest of the file, lowercase hex.
    pub expected_checksum: Option<String>,
}

/// A successfully fetched and verified artifact.
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    /// Where the file was written.
    pub local_path: PathBuf,
    /// Size in bytes.
    pub size_bytes: u64,
    /// SHA-256 digest of the written bytes, lowercase hex.
    pub checksum: String,
}

/// Policy-checked client for remote artifact retrieval.
pub struct SecureFtpClient {
    config: FetchConfig,
}

impl SecureFtpClient {
    /// Create a client enforcing the given fetch policy.
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Check a target against policy without touching the network.
    pub fn check_policy(&self, target: &FetchTarget) -> Result<(), FetchError> {
        if !self
            .config
            .allowed_ftp_hosts
            .iter()
            .any(|allowed| allowed == &target.host)
        {
            return Err(FetchError::HostNotAllowed {
                host: target.host.clone(),
            });
        }
        if target.protocol == FetchProtocol::Ftp && !self.config.allow_plaintext_ftp {
            return Err(FetchError::PlaintextDisabled);
        }
        if target.username.is_empty()
            || target.password.is_empty()
            || target.username.eq_ignore_ascii_case("anonymous")
        {
            return Err(FetchError::AnonymousCredentials);
        }
        Ok(())
    }

    /// Fetch a remote artifact into `local_path`.
    ///
    /// Policy is checked first; a denied target never opens a socket. The
    /// transfer is verified against the expected digest (when supplied and
    /// `require_file_checksum` is set) before the local file is written.
    pub async fn fetch(
        &self,
        target: FetchTarget,
        local_path: &Path,
    ) -> Result<FetchedArtifact, FetchError> {
        if let Err(e) = self.check_policy(&target) {
            audit().log(AuditEvent::FetchDenied {
                host: target.host.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        debug!(
            host = %target.host,
            remote_path = %target.remote_path,
            protocol = ?target.protocol,
            "Starting remote fetch"
        );

        let blocking_target = target.clone();
        let bytes = tokio::task::spawn_blocking(move || download(&blocking_target))
            .await
            .map_err(|e| FetchError::Transfer {
                remote_path: target.remote_path.clone(),
                message: format!("fetch task failed: {}", e),
            })??;

        let checksum = checksum_bytes(&bytes);
        if self.config.require_file_checksum {
            if let Some(expected) = &target.expected_checksum {
                if !expected.eq_ignore_ascii_case(&checksum) {
                    audit().log(AuditEvent::FetchChecksumMismatch {
                        host: target.host.clone(),
                        remote_path: target.remote_path.clone(),
                    });
                    return Err(FetchError::ChecksumMismatch {
                        remote_path: target.remote_path,
                        expected: expected.clone(),
                        actual: checksum,
                    });
                }
            }
        }

        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(FetchError::LocalWrite)?;

        info!(
            host = %target.host,
            remote_path = %target.remote_path,
            size = bytes.len(),
            "Fetched and verified remote artifact"
        );

        Ok(FetchedArtifact {
            local_path: local_path.to_path_buf(),
            size_bytes: bytes.len() as u64,
            checksum,
        })
    }
}

/// Run the blocking transfer for one target.
fn download(target: &FetchTarget) -> Result<Vec<u8>, FetchError> {
    match target.protocol {
        FetchProtocol::Sftp => download_sftp(target),
        FetchProtocol::Ftp => download_ftp(target),
    }
}

fn download_sftp(target: &FetchTarget) -> Result<Vec<u8>, FetchError> {
    let port = target.port.unwrap_or_else(|| target.protocol.default_port());
    let tcp =
        TcpStream::connect((target.host.as_str(), port)).map_err(|e| FetchError::Connect {
            host: target.host.clone(),
            message: e.to_string(),
        })?;

    let mut session = ssh2::Session::new().map_err(|e| FetchError::Connect {
        host: target.host.clone(),
        message: e.to_string(),
    })?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| FetchError::Connect {
        host: target.host.clone(),
        message: e.to_string(),
    })?;

    session
        .userauth_password(&target.username, &target.password)
        .map_err(|_| FetchError::AuthFailed {
            username: target.username.clone(),
            host: target.host.clone(),
        })?;
    if !session.authenticated() {
        return Err(FetchError::AuthFailed {
            username: target.username.clone(),
            host: target.host.clone(),
        });
    }

    let sftp = session.sftp().map_err(|e| FetchError::Transfer {
        remote_path: target.remote_path.clone(),
        message: e.to_string(),
    })?;
    let mut remote =
        sftp.open(Path::new(&target.remote_path))
            .map_err(|e| FetchError::Transfer {
                remote_path: target.remote_path.clone(),
                message: e.to_string(),
            })?;

    let mut bytes = Vec::new();
    remote
        .read_to_end(&mut bytes)
        .map_err(|e| FetchError::Transfer {
            remote_path: target.remote_path.clone(),
            message: e.to_string(),
        })?;
    Ok(bytes)
}

fn download_ftp(target: &FetchTarget) -> Result<Vec<u8>, FetchError> {
    let port = target.port.unwrap_or_else(|| target.protocol.default_port());
    let mut ftp = suppaftp::FtpStream::connect(format!("{}:{}", target.host, port)).map_err(
        |e| FetchError::Connect {
            host: target.host.clone(),
            message: e.to_string(),
        },
    )?;

    ftp.login(&target.username, &target.password)
        .map_err(|_| FetchError::AuthFailed {
            username: target.username.clone(),
            host: target.host.clone(),
        })?;

    let buffer = ftp
        .retr_as_buffer(&target.remote_path)
        .map_err(|e| FetchError::Transfer {
            remote_path: target.remote_path.clone(),
            message: e.to_string(),
        })?;
    let _ = ftp.quit();
    Ok(buffer.into_inner())
}
