use thiserror::Error;

use crate::config::ConfigError;
use crate::lease::{FailureKind, LeaseError};
use crate::raster::RasterError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue API error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// A job-fatal condition, reported to the queue through `fail`.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Cause chain for diagnostics
    pub trace: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            trace: message.clone(),
            message,
        }
    }

    /// Wrap `err`, keeping its full source chain as the trace.
    pub fn from_error(kind: FailureKind, err: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            kind,
            message: err.to_string(),
            trace: error_chain(err),
        }
    }
}

/// Render an error and its `source()` chain, one cause per line.
///
/// Used as the diagnostic trace of a job failure record.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
