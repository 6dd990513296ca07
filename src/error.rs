//! Custom error types for the ingestion pipeline.
//!
//! `PipelineError` is the primary error type. Worker loops never let an
//! item-level failure escape: failures are recorded on the corresponding
//! state-store row with a short [`FailureKind`] plus a truncated message,
//! and only fatal conditions (bad configuration, unreadable state store)
//! propagate to the supervisor.

use thiserror::Error;

/// Short machine-readable failure class recorded on volume and product rows.
///
/// These are stored in the `error_type` columns so an operator (or the
/// stuck-work sweeper) can decide whether a retry makes sense without
/// parsing free-form text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A row claims a local file that no longer exists on disk.
    FileNotFound,
    /// The native decoder failed after all retry attempts.
    DecodeFailed,
    /// Sub-products of one volume disagree on sweep geometry.
    GeometryMismatch,
    /// Writing or removing an output artifact failed.
    IoError,
    /// The canonical container could not be read back.
    ReadError,
    /// Field-name standardization failed.
    Standardize,
    /// No field could be rendered.
    Plot,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::FileNotFound => "FILE_NOT_FOUND",
            FailureKind::DecodeFailed => "DECODE_FAILED",
            FailureKind::GeometryMismatch => "GEOMETRY_MISMATCH",
            FailureKind::IoError => "IO_ERROR",
            FailureKind::ReadError => "READ_ERROR",
            FailureKind::Standardize => "STANDARDIZE",
            FailureKind::Plot => "PLOT",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convenience alias for results using the pipeline error type.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Primary error type for the ingestion pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration file parsing failed.
    ///
    /// Permanent; requires fixing the configuration file. The process
    /// aborts startup and exits non-zero.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration values parsed but failed semantic validation
    /// (empty radar code, window end before start, empty expectation map).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A state-store statement or transaction failed.
    #[error("State store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The state-store connection mutex was poisoned by a panicking thread.
    #[error("State store lock poisoned")]
    StoreLockPoisoned,

    /// A row read back from the state store had an unparseable column.
    #[error("Corrupt state store row: {0}")]
    CorruptRow(String),

    /// A filename did not match the radar naming convention.
    #[error("Unparseable filename '{0}'")]
    BadFilename(String),

    /// Remote server operation failed (listing or transfer).
    #[error("Remote error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    /// Sub-product geometry could not be reconciled onto one range grid.
    #[error("Geometry mismatch: {0}")]
    Geometry(String),

    /// The canonical container could not be written or read.
    #[error("Container error: {0}")]
    Container(String),
}

/// Truncate a row-level error message to a bounded length before it is
/// written into the state store.
pub fn truncate_message(msg: &str, max: usize) -> String {
    if msg.len() <= max {
        msg.to_string()
    } else {
        let mut cut = max;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg[..cut].to_string()
    }
}
