//! Aggregator and paste-service configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Paste service used when `PASTE_URL` is not set.
pub const DEFAULT_PASTE_URL: &str = "https://paste.macports.org/";

/// Largest payload sent to the paste service (8 MiB). Older content is cut.
pub const MAX_PASTE_BYTES: u64 = 8 * 1024 * 1024;

/// Total upload attempts per big file.
pub const UPLOAD_ATTEMPTS: u32 = 3;

/// Idle interval before a keep-alive part is emitted.
pub const KEEP_ALIVE_SECS: u64 = 5 * 60;

/// Deadline for one paste request, connect included.
pub const UPLOAD_TIMEOUT_SECS: u64 = 120;

/// Log pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Paste service endpoint
    pub paste_url: String,
    /// Seconds without events before a heartbeat part is written
    pub keep_alive_secs: u64,
    /// Capacity of the producer queue
    pub queue_capacity: usize,
    /// Capacity of the archiver queue
    pub archive_queue_capacity: usize,
    /// Upload size cap; only the tail of larger logs is sent
    pub max_paste_bytes: u64,
    /// Total attempts per upload
    pub upload_attempts: u32,
    /// Delay before the first retry, doubled after each failure
    pub retry_backoff_ms: u64,
    /// Per-attempt request deadline in seconds, 0 for none
    pub upload_timeout_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            paste_url: DEFAULT_PASTE_URL.to_string(),
            keep_alive_secs: KEEP_ALIVE_SECS,
            queue_capacity: 16,
            archive_queue_capacity: 4,
            max_paste_bytes: MAX_PASTE_BYTES,
            upload_attempts: UPLOAD_ATTEMPTS,
            retry_backoff_ms: 1000,
            upload_timeout_secs: UPLOAD_TIMEOUT_SECS,
        }
    }
}

impl LogConfig {
    /// Defaults, with `PASTE_URL` taken from the environment when it parses.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("PASTE_URL") {
            if url.is_empty() {
                return config;
            }
            match reqwest::Url::parse(&url) {
                Ok(_) => config.paste_url = url,
                Err(e) => warn!(paste_url = %url, error = %e, "Ignoring unparsable PASTE_URL"),
            }
        }
        config
    }

    pub fn with_paste_url(mut self, url: impl Into<String>) -> Self {
        self.paste_url = url.into();
        self
    }

    pub fn with_keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_max_paste_bytes(mut self, bytes: u64) -> Self {
        self.max_paste_bytes = bytes;
        self
    }

    pub fn with_upload_attempts(mut self, attempts: u32) -> Self {
        self.upload_attempts = attempts;
        self
    }

    pub fn with_retry_backoff_ms(mut self, millis: u64) -> Self {
        self.retry_backoff_ms = millis;
        self
    }

    pub fn with_upload_timeout_secs(mut self, secs: u64) -> Self {
        self.upload_timeout_secs = secs;
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        (self.upload_timeout_secs > 0).then(|| Duration::from_secs(self.upload_timeout_secs))
    }
}
