//! Error types shared by every stage of an archive or restore run.
use std::io;
use thiserror::Error;

/// Everything that can stop an imgstow operation.
///
/// A resize that is skipped is not an error; it is reported through
/// [`crate::resize::ResizeOutcome::Skipped`].
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing arguments.
    #[error("{0}")]
    Usage(String),

    /// A check that must pass before anything destructive happens failed.
    #[error("{0}")]
    Precondition(String),

    /// The partition layout could not be read or understood.
    #[error("partition geometry unavailable: {0}")]
    GeometryUnavailable(String),

    /// The space estimate does not fit on a device.
    #[error(
        "not enough space on {device}: {required_mb} MB required, {available_mb} MB available \
         (short by {} MB)",
        short_by(.required_mb, .available_mb)
    )]
    InsufficientSpace {
        device: String,
        required_mb: u64,
        available_mb: u64,
    },

    /// An external tool could not be started or exited with a failure status.
    #[error("`{command}` failed ({status}){}", fmt_stderr(.stderr))]
    ExternalTool {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

fn short_by(required: &u64, available: &u64) -> u64 {
    required.saturating_sub(*available)
}

fn fmt_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

impl Error {
    pub(crate) fn geometry(msg: impl Into<String>) -> Self {
        Error::GeometryUnavailable(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    /// True for errors raised before any destructive step ran.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::Usage(_) | Error::Precondition(_) | Error::InsufficientSpace { .. }
        )
    }
}

/// Result alias used throughout the core library.
pub type Result<T> = std::result::Result<T, Error>;
