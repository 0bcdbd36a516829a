//! Log events flowing from producers into the aggregator.
//!
//! Field names follow the `<scope>-<stage>-<status>` convention, for example
//! `port-zlib-install-output-success`. Repeated names are allowed.

use std::path::PathBuf;

/// Name of the zero-length heartbeat part.
pub const KEEP_ALIVE_FIELD: &str = "keep-alive";

/// Suffix appended to a big-file field once its upload succeeded.
pub const PASTEBIN_SUFFIX: &str = "-pastebin";

/// Suffix appended to a big-file field once every upload attempt failed.
pub const PASTEBIN_FAIL_SUFFIX: &str = "-pastebin-fail";

/// How a file artifact reaches the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// Embedded directly into the document.
    Small,
    /// Uploaded to the paste service; only the URL is embedded.
    Big,
}

/// An in-memory payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEvent {
    pub field: String,
    pub payload: Vec<u8>,
}

impl TextEvent {
    pub fn new(field: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            field: field.into(),
            payload: payload.into(),
        }
    }

    /// Zero-length heartbeat.
    pub fn keep_alive() -> Self {
        Self::new(KEEP_ALIVE_FIELD, Vec::new())
    }

    /// An empty field name marks the end of the stream.
    pub fn is_sentinel(&self) -> bool {
        self.field.is_empty()
    }
}

/// A file on disk whose ownership moves to the consumer.
///
/// Whoever receives the event reads the file and removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub field: String,
    pub path: PathBuf,
    pub size: SizeClass,
}

impl FileEvent {
    pub fn new(field: impl Into<String>, path: impl Into<PathBuf>, size: SizeClass) -> Self {
        Self {
            field: field.into(),
            path: path.into(),
            size,
        }
    }

    pub fn small(field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(field, path, SizeClass::Small)
    }

    pub fn big(field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(field, path, SizeClass::Big)
    }
}

/// Everything a producer can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Text(TextEvent),
    File(FileEvent),
}

impl LogEvent {
    pub fn field(&self) -> &str {
        match self {
            LogEvent::Text(text) => &text.field,
            LogEvent::File(file) => &file.field,
        }
    }
}

impl From<TextEvent> for LogEvent {
    fn from(event: TextEvent) -> Self {
        LogEvent::Text(event)
    }
}

impl From<FileEvent> for LogEvent {
    fn from(event: FileEvent) -> Self {
        LogEvent::File(event)
    }
}

/// `<field>-pastebin`
pub fn pastebin_field(field: &str) -> String {
    format!("{field}{PASTEBIN_SUFFIX}")
}

/// `<field>-pastebin-fail`
pub fn pastebin_fail_field(field: &str) -> String {
    format!("{field}{PASTEBIN_FAIL_SUFFIX}")
}
