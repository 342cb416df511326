//! # FTP Source
//!
//! The thin FTP client behind discovery and download. `suppaftp` is a
//! blocking client, so every session runs on the blocking thread pool via
//! `tokio::task::spawn_blocking`; the async side only sees the result.
//!
//! A session is opened per call (connect, login, one command, quit).
//!
//! Downloads land in `<local_file>.tmp` first and are renamed over the final
//! path only after the whole file was written; a failed transfer never leaves
//! a half-written file behind.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::types::FileType;
use suppaftp::FtpStream;
use thiserror::Error;

use super::file_discovery::ListingProvider;
use crate::configs::config_relay::RelayConfig;

const DEFAULT_FTP_PORT: u16 = 21;
/// Socket timeout for connect, control and data traffic.
pub const FTP_TIMEOUT: Duration = Duration::from_secs(30);

/// # Transfer Error
///
/// A recoverable failure to list, fetch or read a file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The FTP host name did not resolve to an address.
    #[error("Cannot resolve FTP host {host}: {reason}")]
    Resolve {
        /// Host as configured.
        host: String,
        /// Resolver error text.
        reason: String,
    },

    /// TCP connect or login failed.
    #[error("FTP connection to {host} failed: {reason}")]
    Connect {
        /// Host as configured.
        host: String,
        /// Connection or login error text.
        reason: String,
    },

    /// The server rejected a command or the data transfer broke off.
    #[error("FTP transfer failed: {0}")]
    Protocol(String),

    /// Reading or writing a local file failed.
    #[error("Local file error on {}: {source}", .path.display())]
    Io {
        /// The local path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The blocking worker panicked or was cancelled.
    #[error("FTP worker stopped unexpectedly: {0}")]
    Worker(String),
}

/// # Downloader
///
/// Fetches a remote file to local storage atomically.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Downloads `remote_path` and returns the local path it was stored at.
    async fn fetch(&self, remote_path: &str) -> Result<PathBuf, TransferError>;
}

/// # FTP Source
///
/// Credentials and target path for the data logger's FTP server.
#[derive(Clone)]
pub struct FtpSource {
    /// `host` or `host:port`.
    host: String,
    user: String,
    pass: String,
    /// Final location of the downloaded file.
    local_file: PathBuf,
    /// Socket timeout for every session.
    timeout: Duration,
}

impl FtpSource {
    /// Creates a source from explicit settings.
    pub fn new(host: &str, user: &str, pass: &str, local_file: &Path) -> Self {
        Self {
            host: host.trim().to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
            local_file: local_file.to_path_buf(),
            timeout: FTP_TIMEOUT,
        }
    }

    /// Creates a source from the relay configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(&config.ftp_host, &config.ftp_user, &config.ftp_pass, &config.local_file)
    }

    /// The path downloads are promoted to.
    pub fn local_file(&self) -> &Path {
        &self.local_file
    }

    /// Opens a logged-in binary-mode session. Blocking.
    fn open_session(&self) -> Result<FtpStream, TransferError> {
        let address = resolve(&self.host)?;
        let mut ftp = FtpStream::connect_timeout(address, self.timeout).map_err(|e| {
            TransferError::Connect {
                host: self.host.clone(),
                reason: e.to_string(),
            }
        })?;
        let socket = ftp.get_ref();
        let timeouts = socket
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| socket.set_write_timeout(Some(self.timeout)));
        if let Err(e) = timeouts {
            log::warn!("FTP: could not set socket timeouts on {}: {}", self.host, e);
        }
        ftp.login(self.user.as_str(), self.pass.as_str())
            .map_err(|e| TransferError::Connect {
                host: self.host.clone(),
                reason: format!("login as {} rejected: {}", self.user, e),
            })?;
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| TransferError::Protocol(e.to_string()))?;
        Ok(ftp)
    }

    fn list_blocking(&self, dir: &str) -> Result<String, TransferError> {
        let mut ftp = self.open_session()?;
        let result = ftp
            .nlst(Some(dir))
            .map_err(|e| TransferError::Protocol(format!("NLST {}: {}", dir, e)));
        close_session(&mut ftp);
        Ok(result?.join("\n"))
    }

    fn retrieve_blocking(&self, remote_path: &str) -> Result<Vec<u8>, TransferError> {
        let mut ftp = self.open_session()?;
        let result = ftp
            .retr_as_buffer(remote_path)
            .map_err(|e| TransferError::Protocol(format!("RETR {}: {}", remote_path, e)));
        close_session(&mut ftp);
        Ok(result?.into_inner())
    }

    /// Runs a blocking session closure on the blocking pool.
    async fn in_session<T, F>(&self, work: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(FtpSource) -> Result<T, TransferError> + Send + 'static,
    {
        let source = self.clone();
        tokio::task::spawn_blocking(move || work(source))
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))?
    }
}

fn close_session(ftp: &mut FtpStream) {
    if let Err(e) = ftp.quit() {
        log::debug!("FTP: QUIT failed: {}", e);
    }
}

/// Appends the default FTP port when `host` carries none.
pub fn ftp_address(host: &str) -> String {
    let has_port = host
        .rsplit_once(':')
        .map(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    if has_port {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_FTP_PORT)
    }
}

fn resolve(host: &str) -> Result<SocketAddr, TransferError> {
    let address = ftp_address(host);
    let mut candidates = address.to_socket_addrs().map_err(|e| TransferError::Resolve {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    candidates.next().ok_or_else(|| TransferError::Resolve {
        host: host.to_string(),
        reason: "no addresses returned".to_string(),
    })
}

/// The temporary path a download is staged at before promotion.
pub fn staging_path(local_file: &Path) -> PathBuf {
    let mut name = local_file.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `bytes` to the staging path and renames it over `local_file`.
/// The staging file is removed when either step fails.
pub async fn promote_download(local_file: &Path, bytes: &[u8]) -> Result<(), TransferError> {
    let staging = staging_path(local_file);
    if let Err(source) = tokio::fs::write(&staging, bytes).await {
        discard(&staging).await;
        return Err(TransferError::Io { path: staging, source });
    }
    if let Err(source) = tokio::fs::rename(&staging, local_file).await {
        discard(&staging).await;
        return Err(TransferError::Io {
            path: local_file.to_path_buf(),
            source,
        });
    }
    Ok(())
}

async fn discard(staging: &Path) {
    if let Err(e) = tokio::fs::remove_file(staging).await {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }
    }
}

#[async_trait]
impl ListingProvider for FtpSource {
    async fn list(&self, dir: &str) -> Result<String, TransferError> {
        let dir_owned = dir.to_string();
        let listing = self
            .in_session(move |source| source.list_blocking(&dir_owned))
            .await?;
        log::debug!("FTP: listed {} ({} bytes)", dir, listing.len());
        Ok(listing)
    }
}

#[async_trait]
impl Downloader for FtpSource {
    async fn fetch(&self, remote_path: &str) -> Result<PathBuf, TransferError> {
        let remote_owned = remote_path.to_string();
        let bytes = self
            .in_session(move |source| source.retrieve_blocking(&remote_owned))
            .await?;
        promote_download(&self.local_file, &bytes).await?;
        log::info!(
            "FTP: Successfully downloaded {} ({} bytes) to {}",
            remote_path,
            bytes.len(),
            self.local_file.display()
        );
        Ok(self.local_file.clone())
    }
}
