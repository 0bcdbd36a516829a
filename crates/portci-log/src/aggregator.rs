//! Single-writer log aggregator.
//!
//! Exactly one task owns the [`DocumentWriter`]. Producers talk to it through
//! cloneable [`LogHandle`]s backed by one bounded queue, so parts appear in
//! the order events were enqueued. The remote archiver runs beside it and
//! reports back on a queue of its own.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::archiver::{ArchiveOutcome, ArchiveRequest, RemoteArchiver};
use crate::config::LogConfig;
use crate::document::DocumentWriter;
use crate::error::LogError;
use crate::event::{pastebin_fail_field, FileEvent, LogEvent, SizeClass, TextEvent};
use crate::Result;

#[derive(Debug)]
enum Inbound {
    Event(LogEvent),
    Close,
}

/// Producer side of the aggregator.
///
/// Sends wait for queue capacity. Once the aggregator is gone every send
/// fails with [`LogError::Closed`].
#[derive(Debug, Clone)]
pub struct LogHandle {
    tx: mpsc::Sender<Inbound>,
}

impl LogHandle {
    pub async fn send(&self, event: impl Into<LogEvent>) -> Result<()> {
        self.tx
            .send(Inbound::Event(event.into()))
            .await
            .map_err(|_| LogError::Closed)
    }

    pub async fn text(&self, field: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.send(TextEvent::new(field, payload)).await
    }

    pub async fn file(
        &self,
        field: impl Into<String>,
        path: impl Into<PathBuf>,
        size: SizeClass,
    ) -> Result<()> {
        self.send(FileEvent::new(field, path, size)).await
    }

    /// Ask the aggregator to finish the document once pending uploads resolve.
    pub async fn close(&self) -> Result<()> {
        self.tx.send(Inbound::Close).await.map_err(|_| LogError::Closed)
    }
}

/// Counters describing a finished document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentSummary {
    /// Parts written, keep-alives included
    pub parts: usize,
    pub keep_alives: usize,
    /// Big files whose URL made it into the document
    pub pastebin: usize,
    /// Big files that ended as `-pastebin-fail`
    pub pastebin_failed: usize,
    /// Events that produced no part (unreadable small files)
    pub dropped: usize,
}

/// Result of [`LogAggregator::wait`].
#[derive(Debug)]
pub struct Finished<W> {
    pub summary: DocumentSummary,
    pub output: W,
}

/// Owner of the aggregator task.
pub struct LogAggregator<W> {
    handle: LogHandle,
    content_type: String,
    task: JoinHandle<Result<Finished<W>>>,
}

impl<W> LogAggregator<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the aggregator and archiver tasks on the current runtime.
    pub fn start(output: W, config: LogConfig) -> Result<Self> {
        let archiver = RemoteArchiver::new(&config)?;

        let (tx, inbound) = mpsc::channel(config.queue_capacity.max(1));
        let (archive_tx, archive_rx) = mpsc::channel(config.archive_queue_capacity.max(1));
        let (outcome_tx, outcomes) = mpsc::channel(config.archive_queue_capacity.max(1));
        let archiver = tokio::spawn(archiver.run(archive_rx, outcome_tx));

        let document = DocumentWriter::new(output);
        let content_type = document.content_type();
        info!(
            boundary = %document.boundary(),
            paste_url = %config.paste_url,
            keep_alive_secs = config.keep_alive().as_secs(),
            "Log aggregator started"
        );

        let task = AggregatorTask {
            document,
            inbound,
            outcomes,
            archive: Some(archive_tx),
            archiver,
            keep_alive: config.keep_alive(),
            summary: DocumentSummary::default(),
        };

        Ok(LogAggregator {
            handle: LogHandle { tx },
            content_type,
            task: tokio::spawn(task.run()),
        })
    }

    pub fn handle(&self) -> LogHandle {
        self.handle.clone()
    }

    /// `Content-Type` of the produced document, boundary included.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub async fn close(&self) -> Result<()> {
        self.handle.close().await
    }

    /// Wait until the document is complete. Finishes once every handle is
    /// dropped or a close was requested, and all uploads have resolved.
    pub async fn wait(self) -> Result<Finished<W>> {
        drop(self.handle);
        self.task
            .await
            .map_err(|e| LogError::Task(e.to_string()))?
    }
}

struct AggregatorTask<W> {
    document: DocumentWriter<W>,
    inbound: mpsc::Receiver<Inbound>,
    outcomes: mpsc::Receiver<ArchiveOutcome>,
    /// `None` once the archiver was told to close.
    archive: Option<mpsc::Sender<ArchiveRequest>>,
    archiver: JoinHandle<()>,
    keep_alive: Duration,
    summary: DocumentSummary,
}

impl<W> AggregatorTask<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> Result<Finished<W>> {
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;

                outcome = self.outcomes.recv() => match outcome {
                    Some(ArchiveOutcome::Resolved { event, uploaded }) => {
                        self.write_resolved(event, uploaded).await;
                    }
                    Some(ArchiveOutcome::Drained) => break,
                    None => {
                        if self.archive.is_some() {
                            warn!("Remote archiver stopped unexpectedly");
                        }
                        break;
                    }
                },

                inbound = self.inbound.recv(), if inbound_open => match inbound {
                    Some(Inbound::Event(event)) => self.dispatch(event).await,
                    Some(Inbound::Close) => self.shutdown_archiver().await,
                    None => {
                        inbound_open = false;
                        self.shutdown_archiver().await;
                    }
                },

                _ = tokio::time::sleep(self.keep_alive) => {
                    if self.write_text(TextEvent::keep_alive()).await {
                        self.summary.keep_alives += 1;
                    }
                }
            }
        }

        if let Err(e) = (&mut self.archiver).await {
            warn!(error = %e, "Remote archiver task failed");
        }

        // Late producers see `Closed` from here on. Events already accepted
        // still get their part; big files can only fail now.
        self.archive = None;
        self.inbound.close();
        while let Ok(inbound) = self.inbound.try_recv() {
            if let Inbound::Event(event) = inbound {
                debug!(field = %event.field(), "Resolving event queued behind close");
                self.dispatch(event).await;
            }
        }

        let summary = self.summary;
        let output = self.document.finish().await.map_err(LogError::Document)?;
        info!(
            parts = summary.parts,
            keep_alives = summary.keep_alives,
            pastebin = summary.pastebin,
            pastebin_failed = summary.pastebin_failed,
            dropped = summary.dropped,
            "Log document finished"
        );
        Ok(Finished { summary, output })
    }

    async fn dispatch(&mut self, event: LogEvent) {
        match event {
            LogEvent::Text(text) if text.is_sentinel() => self.shutdown_archiver().await,
            LogEvent::Text(text) => {
                self.write_text(text).await;
            }
            LogEvent::File(file) => match file.size {
                SizeClass::Small => self.embed_file(file).await,
                SizeClass::Big => self.forward(file).await,
            },
        }
    }

    /// Returns whether the part was written.
    async fn write_text(&mut self, event: TextEvent) -> bool {
        match self.document.write_part(&event.field, &event.payload).await {
            Ok(()) => {
                self.summary.parts += 1;
                debug!(field = %event.field, bytes = event.payload.len(), "Wrote text part");
                true
            }
            Err(e) => {
                warn!(field = %event.field, error = %e, "Failed to write text part");
                self.summary.dropped += 1;
                false
            }
        }
    }

    async fn write_resolved(&mut self, event: TextEvent, uploaded: bool) {
        if !self.write_text(event).await {
            return;
        }
        if uploaded {
            self.summary.pastebin += 1;
        } else {
            self.summary.pastebin_failed += 1;
        }
    }

    async fn embed_file(&mut self, file: FileEvent) {
        match tokio::fs::File::open(&file.path).await {
            Ok(mut source) => {
                let started = self.document.parts();
                match self.document.write_part_from(&file.field, &mut source).await {
                    Ok(bytes) => {
                        self.summary.parts += 1;
                        debug!(field = %file.field, bytes, "Embedded log file");
                    }
                    // The header is out, so the part stays in the document
                    // with whatever body made it.
                    Err(e) if self.document.parts() > started => {
                        warn!(field = %file.field, path = %file.path.display(), error = %e, "Log file truncated while embedding");
                        self.summary.parts += 1;
                    }
                    Err(e) => {
                        warn!(field = %file.field, path = %file.path.display(), error = %e, "Failed to embed log file");
                        self.summary.dropped += 1;
                    }
                }
            }
            Err(e) => {
                warn!(field = %file.field, path = %file.path.display(), error = %e, "Dropping unreadable log file");
                self.summary.dropped += 1;
            }
        }
        remove_quietly(&file.path).await;
    }

    async fn forward(&mut self, file: FileEvent) {
        let Some(archive) = self.archive.clone() else {
            self.reject_big(file, "log aggregator was already closing")
                .await;
            return;
        };

        if let Err(ArchiveRequest::Upload(file)) =
            self.send_to_archiver(&archive, ArchiveRequest::Upload(file)).await
        {
            self.reject_big(file, "remote archiver stopped").await;
        }
    }

    async fn reject_big(&mut self, file: FileEvent, reason: &str) {
        warn!(field = %file.field, reason, "Big log file not uploaded");
        let event = TextEvent::new(pastebin_fail_field(&file.field), reason);
        self.write_resolved(event, false).await;
        remove_quietly(&file.path).await;
    }

    /// Tell the archiver no more uploads follow. Idempotent.
    async fn shutdown_archiver(&mut self) {
        let Some(archive) = self.archive.take() else {
            return;
        };
        debug!("Close requested, draining remote archiver");
        if self
            .send_to_archiver(&archive, ArchiveRequest::Close)
            .await
            .is_err()
        {
            warn!("Remote archiver stopped before close");
        }
    }

    /// Enqueue `request` for the archiver while writing its results, so a
    /// full archiver queue cannot deadlock the two tasks. Hands the request
    /// back when the archiver is gone.
    async fn send_to_archiver(
        &mut self,
        archive: &mpsc::Sender<ArchiveRequest>,
        request: ArchiveRequest,
    ) -> std::result::Result<(), ArchiveRequest> {
        loop {
            tokio::select! {
                biased;

                permit = archive.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(request);
                            Ok(())
                        }
                        Err(_) => Err(request),
                    };
                }

                Some(ArchiveOutcome::Resolved { event, uploaded }) = self.outcomes.recv() => {
                    self.write_resolved(event, uploaded).await;
                }
            }
        }
    }

}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove log file");
        }
    }
}
