//! Error types for portci

use portci_log::LogError;
use thiserror::Error;

/// Failures invoking the external build tooling.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The program could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and reported failure
    #[error("{command} exited with {}: {output}", .code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// The stage deadline passed and the process was killed
    #[error("{command} timed out after {secs}s")]
    TimedOut { command: String, secs: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the build worker and run coordinator.
#[derive(Error, Debug)]
pub enum CiError {
    /// Build tool error
    #[error("build tool error: {0}")]
    Tool(#[from] ToolError),

    /// Changed-port detection failed
    #[error("git error: {0}")]
    Git(String),

    /// Log pipeline error
    #[error("log pipeline error: {0}")]
    Log(#[from] LogError),

    /// A worker task panicked or went away
    #[error("worker error: {0}")]
    Worker(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The run completed but something in it failed
    #[error("run failed (lint failed: {lint_failed}, build failed: {build_failed})")]
    RunFailed { lint_failed: bool, build_failed: bool },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CiError {
    fn from(err: serde_json::Error) -> Self {
        CiError::Config(err.to_string())
    }
}

/// Result type for portci operations
pub type Result<T> = std::result::Result<T, CiError>;
