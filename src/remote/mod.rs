//! Remote file server access.
//!
//! The pipeline reaches the upstream server exclusively through the
//! [`RemoteStore`] trait: a directory listing and a verified sequential
//! download. The production implementation speaks FTP; tests substitute an
//! in-memory tree. Listing a directory that does not exist yet (future
//! hours of the calendar hierarchy) is an expected condition and is
//! distinguished from transport failures.

mod ftp;
pub mod walker;

pub use ftp::FtpRemote;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Errors from the remote server boundary.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The listed or fetched path does not exist on the server.
    #[error("remote path not found: {0}")]
    NotFound(String),
    /// Connection, authentication, or transfer failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The operation exceeded its deadline.
    #[error("remote operation timed out: {0}")]
    Timeout(String),
    /// Writing the received bytes locally failed.
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Outcome of one completed download.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Bytes actually received and written.
    pub bytes: u64,
    /// Hex SHA-256 of the received byte stream.
    pub digest: String,
    /// Size the server reported before the transfer, when available.
    pub reported_size: Option<u64>,
}

/// Minimal capability set the pipeline needs from the upstream server.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List entry names under a remote directory.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>, RemoteError>;

    /// Stream one remote file to `local_tmp`, computing a running SHA-256.
    ///
    /// The file is written completely or the call errors; the caller owns
    /// renaming the temp file into place and cleaning up after failures.
    async fn download(&self, remote_path: &str, local_tmp: &Path) -> Result<Fetched, RemoteError>;
}
