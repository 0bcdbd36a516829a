//! Error types for portci-log

use thiserror::Error;

/// Errors surfaced by the log aggregator and its producer handles.
#[derive(Error, Debug)]
pub enum LogError {
    /// The aggregator stopped accepting events
    #[error("log aggregator is no longer accepting events")]
    Closed,

    /// Writing or finishing the document stream failed
    #[error("document stream error: {0}")]
    Document(#[source] std::io::Error),

    /// A serialized document could not be parsed
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Paste endpoint URL is unusable
    #[error("invalid paste endpoint {url}: {reason}")]
    InvalidPasteUrl { url: String, reason: String },

    /// HTTP client construction failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// The aggregator task panicked or was cancelled
    #[error("log aggregator task failed: {0}")]
    Task(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for LogError {
    fn from(err: reqwest::Error) -> Self {
        LogError::Http(err.to_string())
    }
}

/// Failure of a single paste upload.
///
/// Only transport failures and a missing `Location` header are worth another
/// attempt; everything else fails the same way every time.
#[derive(Error, Debug)]
pub enum UploadError {
    /// Reading the source log failed
    #[error("failed to read log: {0}")]
    Io(#[from] std::io::Error),

    /// Request never produced a response
    #[error("paste request failed: {0}")]
    Transport(String),

    /// Response carried no redirect target
    #[error("missing Location header (HTTP {status})")]
    MissingLocation { status: u16 },

    /// Redirect target could not be resolved
    #[error("invalid Location header {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl UploadError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Transport(_) | UploadError::MissingLocation { .. }
        )
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Transport(err.to_string())
    }
}
