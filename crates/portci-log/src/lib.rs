//! portci-log: build-log aggregation for port CI runs
//!
//! Producers (build workers, the run coordinator) send [`LogEvent`]s through a
//! [`LogHandle`]. A single aggregator task serializes them into one streaming
//! `multipart/form-data` document. Small files are embedded directly; big
//! files are handed to a [`RemoteArchiver`], which uploads them to a paste
//! service and feeds the resulting URL back into the document.
//!
//! ```text
//! producers ──► LogHandle ──► aggregator ──► DocumentWriter ──► output
//!                                │   ▲
//!                      big files ▼   │ -pastebin / -pastebin-fail
//!                             RemoteArchiver ──► paste service
//! ```

pub mod aggregator;
pub mod archiver;
pub mod config;
pub mod document;
mod error;
pub mod event;

pub use aggregator::{DocumentSummary, Finished, LogAggregator, LogHandle};
pub use archiver::{read_tail, RemoteArchiver, PASTE_FIELD};
pub use config::LogConfig;
pub use document::{
    boundary_from_content_type, parse_document, parse_document_detect, DocumentWriter, Part,
};
pub use error::{LogError, UploadError};
pub use event::{FileEvent, LogEvent, SizeClass, TextEvent};

/// Result type for log pipeline operations
pub type Result<T> = std::result::Result<T, LogError>;
