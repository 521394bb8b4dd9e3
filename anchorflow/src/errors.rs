use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::workflow::WorkflowStep;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Anchor '{anchor}' not found after {attempts} attempt(s) in {elapsed:?}")]
    AnchorNotFound {
        anchor: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Anchor '{anchor}' still visible after {elapsed:?}")]
    AnchorStillVisible { anchor: String, elapsed: Duration },

    #[error("Download did not complete within {elapsed:?}")]
    DownloadTimeout { elapsed: Duration },

    #[error("Download made no progress after {attempts} poll(s)")]
    DownloadStalled { attempts: u32 },

    #[error("Downloaded file {path:?} could not be opened after {attempts} attempt(s)")]
    FileUnopenable { path: PathBuf, attempts: u32 },

    #[error("Could not confirm the item tab after capture within {elapsed:?}")]
    CleanupFailed { elapsed: Duration },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Screen capture failed: {0}")]
    Capture(String),

    #[error("Input synthesis failed: {0}")]
    Input(String),

    #[error("Post-processing failed: {0}")]
    PostProcessing(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background run failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Fieldless classification of [`FlowError`], used to declare which failures
/// a [`crate::RetryPolicy`] may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AnchorNotFound,
    AnchorStillVisible,
    DownloadTimeout,
    DownloadStalled,
    FileUnopenable,
    CleanupFailed,
    Configuration,
    Capture,
    Input,
    PostProcessing,
    Cancelled,
    Worker,
    Io,
    Image,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::AnchorNotFound { .. } => ErrorKind::AnchorNotFound,
            FlowError::AnchorStillVisible { .. } => ErrorKind::AnchorStillVisible,
            FlowError::DownloadTimeout { .. } => ErrorKind::DownloadTimeout,
            FlowError::DownloadStalled { .. } => ErrorKind::DownloadStalled,
            FlowError::FileUnopenable { .. } => ErrorKind::FileUnopenable,
            FlowError::CleanupFailed { .. } => ErrorKind::CleanupFailed,
            FlowError::Configuration(_) => ErrorKind::Configuration,
            FlowError::Capture(_) => ErrorKind::Capture,
            FlowError::Input(_) => ErrorKind::Input,
            FlowError::PostProcessing(_) => ErrorKind::PostProcessing,
            FlowError::Cancelled => ErrorKind::Cancelled,
            FlowError::Worker(_) => ErrorKind::Worker,
            FlowError::Io(_) => ErrorKind::Io,
            FlowError::Image(_) => ErrorKind::Image,
        }
    }
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// A failed item: the stage that failed, how long the item ran, and why.
#[derive(Error, Debug)]
#[error("Item {item} failed during {stage:?} after {elapsed:?}: {source}")]
pub struct ItemFailure {
    pub item: usize,
    pub stage: WorkflowStep,
    pub elapsed: Duration,
    #[source]
    pub source: FlowError,
}
