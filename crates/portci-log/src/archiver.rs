//! Remote archiver for oversized logs.
//!
//! Big log files never pass through the document. They are uploaded to a
//! paste service, which answers with a redirect whose `Location` is the
//! durable URL of the stored log; only that URL ends up in the document.
//! Uploads run on their own task so a slow paste service never stalls the
//! aggregator.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{redirect, Url};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{LogError, UploadError};
use crate::event::{pastebin_fail_field, pastebin_field, FileEvent, TextEvent};
use crate::Result;

/// Multipart field the paste service expects.
pub const PASTE_FIELD: &str = "paste";

/// Work handed from the aggregator to the archiver.
#[derive(Debug)]
pub(crate) enum ArchiveRequest {
    Upload(FileEvent),
    /// Sent once, after the last upload request.
    Close,
}

/// Results flowing back into the aggregator.
#[derive(Debug)]
pub(crate) enum ArchiveOutcome {
    Resolved { event: TextEvent, uploaded: bool },
    /// Every upload requested before `Close` has been resolved.
    Drained,
}

/// Paste-service client with bounded retry and tail truncation.
#[derive(Debug, Clone)]
pub struct RemoteArchiver {
    client: reqwest::Client,
    paste_url: Url,
    max_bytes: u64,
    attempts: u32,
    backoff: Duration,
}

impl RemoteArchiver {
    /// Build the client. Redirects are never followed: the redirect itself is
    /// the answer.
    pub fn new(config: &LogConfig) -> Result<Self> {
        let paste_url =
            Url::parse(&config.paste_url).map_err(|e| LogError::InvalidPasteUrl {
                url: config.paste_url.clone(),
                reason: e.to_string(),
            })?;
        if paste_url.cannot_be_a_base() {
            return Err(LogError::InvalidPasteUrl {
                url: config.paste_url.clone(),
                reason: "cannot resolve relative locations against it".to_string(),
            });
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("portci/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::none());
        // An expired deadline surfaces as a transport error and is retried.
        if let Some(limit) = config.upload_timeout() {
            builder = builder.connect_timeout(limit).timeout(limit);
        }
        let client = builder.build()?;

        Ok(RemoteArchiver {
            client,
            paste_url,
            max_bytes: config.max_paste_bytes,
            attempts: config.upload_attempts.max(1),
            backoff: config.retry_backoff(),
        })
    }

    pub fn paste_url(&self) -> &Url {
        &self.paste_url
    }

    /// Upload a big file and turn the result into a document event.
    ///
    /// The source file is removed afterwards whatever the outcome.
    pub async fn archive(&self, file: FileEvent) -> (TextEvent, bool) {
        let result = self.upload(&file.path).await;

        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %file.path.display(), error = %e, "Failed to remove uploaded log");
            }
        }

        match result {
            Ok(url) => {
                info!(field = %file.field, url = %url, "Uploaded log to paste service");
                (TextEvent::new(pastebin_field(&file.field), url.to_string()), true)
            }
            Err(e) => {
                warn!(field = %file.field, error = %e, "Giving up on log upload");
                (TextEvent::new(pastebin_fail_field(&file.field), e.to_string()), false)
            }
        }
    }

    /// Read the tail of `path` and post it, retrying transient failures.
    pub async fn upload(&self, path: &Path) -> std::result::Result<Url, UploadError> {
        let payload = read_tail(path, self.max_bytes).await?;
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            match self.post(payload.clone()).await {
                Ok(url) => return Ok(url),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Paste upload failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post(&self, payload: Vec<u8>) -> std::result::Result<Url, UploadError> {
        let form = Form::new().part(PASTE_FIELD, Part::bytes(payload));
        let response = self
            .client
            .post(self.paste_url.clone())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .ok_or(UploadError::MissingLocation {
                status: status.as_u16(),
            })?;
        let location = location
            .to_str()
            .map_err(|e| UploadError::InvalidLocation {
                location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
                reason: e.to_string(),
            })?;

        debug!(status = status.as_u16(), location, "Paste service answered");
        self.paste_url
            .join(location)
            .map_err(|e| UploadError::InvalidLocation {
                location: location.to_string(),
                reason: e.to_string(),
            })
    }

    /// Archiver loop: uploads in arrival order until `Close`, then reports
    /// `Drained` so the aggregator can finish the document.
    pub(crate) async fn run(
        self,
        mut requests: mpsc::Receiver<ArchiveRequest>,
        outcomes: mpsc::Sender<ArchiveOutcome>,
    ) {
        while let Some(request) = requests.recv().await {
            match request {
                ArchiveRequest::Upload(file) => {
                    let (event, uploaded) = self.archive(file).await;
                    let outcome = ArchiveOutcome::Resolved { event, uploaded };
                    if outcomes.send(outcome).await.is_err() {
                        warn!("Log aggregator went away, dropping upload result");
                        return;
                    }
                }
                ArchiveRequest::Close => break,
            }
        }

        debug!("Remote archiver drained");
        let _ = outcomes.send(ArchiveOutcome::Drained).await;
    }
}

/// Read at most `max` bytes from the end of `path`.
///
/// Logs over the cap lose their oldest content; the tail holds the failure.
pub async fn read_tail(path: &Path, max: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len > max {
        file.seek(SeekFrom::Start(len - max)).await?;
    }

    let mut buf = Vec::with_capacity(len.min(max) as usize);
    file.take(max).read_to_end(&mut buf).await?;
    Ok(buf)
}
