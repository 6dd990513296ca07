//! FTP implementation of the remote store.
//!
//! The FTP protocol library is synchronous, so every operation runs inside
//! `tokio::task::spawn_blocking` with a fresh, short-lived session per
//! call. Per-download sessions keep a slow transfer from wedging the
//! control connection of unrelated operations; the Fetcher's semaphore
//! already caps how many run at once.

use sha2::{Digest, Sha256};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::debug;

use super::{Fetched, RemoteError, RemoteStore};
use crate::config::Settings;

/// Remote store backed by an FTP server.
pub struct FtpRemote {
    host: String,
    username: String,
    password: String,
    listing_timeout: Duration,
    download_timeout: Duration,
}

impl FtpRemote {
    pub fn new(settings: &Settings) -> Self {
        Self {
            host: settings.connection.host.clone(),
            username: settings.connection.username.clone(),
            password: settings.connection.password.clone(),
            listing_timeout: Duration::from_secs(settings.tuning.listing_timeout_secs),
            download_timeout: Duration::from_secs(settings.tuning.download_timeout_secs),
        }
    }

    fn connect(
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<FtpStream, RemoteError> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:21")
        };
        let mut ftp = FtpStream::connect(addr.as_str()).map_err(map_ftp_error(&addr))?;
        ftp.login(username, password).map_err(map_ftp_error(&addr))?;
        ftp.transfer_type(FileType::Binary)
            .map_err(map_ftp_error(&addr))?;
        Ok(ftp)
    }
}

/// Classify an FTP error: a 550-family reply means the path does not
/// exist (or is not accessible), anything else is a transport failure.
fn map_ftp_error(context: &str) -> impl Fn(FtpError) -> RemoteError + '_ {
    move |err| match &err {
        FtpError::UnexpectedResponse(resp) if resp.status == Status::FileUnavailable => {
            RemoteError::NotFound(context.to_string())
        }
        _ => RemoteError::Transport(format!("{context}: {err}")),
    }
}

#[async_trait::async_trait]
impl RemoteStore for FtpRemote {
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let host = self.host.clone();
        let username = self.username.clone();
        let password = self.password.clone();
        let path = path.to_string();
        let path_for_timeout = path.clone();

        let listing = tokio::time::timeout(
            self.listing_timeout,
            tokio::task::spawn_blocking(move || -> Result<Vec<String>, RemoteError> {
                let mut ftp = Self::connect(&host, &username, &password)?;
                ftp.cwd(&path).map_err(map_ftp_error(&path))?;
                let names = ftp.nlst(None).map_err(map_ftp_error(&path))?;
                let _ = ftp.quit();
                // some servers return full paths from NLST
                Ok(names
                    .into_iter()
                    .filter_map(|n| {
                        let name = n.rsplit('/').next().unwrap_or(&n).to_string();
                        (!name.is_empty() && name != "." && name != "..").then_some(name)
                    })
                    .collect())
            }),
        )
        .await
        .map_err(|_| RemoteError::Timeout(format!("listing {path_for_timeout}")))?
        .map_err(|e| RemoteError::Transport(format!("listing task failed: {e}")))??;

        Ok(listing)
    }

    async fn download(&self, remote_path: &str, local_tmp: &Path) -> Result<Fetched, RemoteError> {
        let host = self.host.clone();
        let username = self.username.clone();
        let password = self.password.clone();
        let remote = remote_path.to_string();
        let local: PathBuf = local_tmp.to_path_buf();

        let fetched = tokio::time::timeout(
            self.download_timeout,
            tokio::task::spawn_blocking(move || -> Result<Fetched, RemoteError> {
                let mut ftp = Self::connect(&host, &username, &password)?;

                let (dir, name) = remote
                    .rsplit_once('/')
                    .ok_or_else(|| RemoteError::Transport(format!("bad remote path {remote}")))?;
                ftp.cwd(dir).map_err(map_ftp_error(&remote))?;

                let reported_size = ftp.size(name).ok().map(|s| s as u64);

                if let Some(parent) = local.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::File::create(&local)?;
                let mut writer = BufWriter::new(file);
                let mut hasher = Sha256::new();
                let mut bytes: u64 = 0;

                ftp.retr(name, |reader| {
                    let mut buf = [0u8; 64 * 1024];
                    loop {
                        let n = reader.read(&mut buf).map_err(FtpError::ConnectionError)?;
                        if n == 0 {
                            break;
                        }
                        hasher.update(&buf[..n]);
                        writer
                            .write_all(&buf[..n])
                            .map_err(FtpError::ConnectionError)?;
                        bytes += n as u64;
                    }
                    Ok(())
                })
                .map_err(map_ftp_error(&remote))?;

                writer.flush()?;
                let _ = ftp.quit();

                debug!(remote = %remote, bytes, "Downloaded remote file");
                Ok(Fetched {
                    bytes,
                    digest: format!("{:x}", hasher.finalize()),
                    reported_size,
                })
            }),
        )
        .await
        .map_err(|_| RemoteError::Timeout(format!("downloading {remote_path}")))?
        .map_err(|e| RemoteError::Transport(format!("download task failed: {e}")))??;

        Ok(fetched)
    }
}
