//! Sequential build pipeline for the ports of a run.
//!
//! For every queued port the worker lists its subports, then per subport runs
//! cleanup, dependency installation and port installation through the
//! [`BuildTool`], handing every log it produces to the aggregator. Failures
//! are recorded as document parts and in the sticky [`BuildStatus`]; nothing
//! aborts the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use portci_log::{FileEvent, LogEvent, SizeClass, TextEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CiError, Result};
use crate::tool::{BuildTool, MpbbCommand, StageStatus};
use crate::worker::{BuildStatus, RunContext, WorkerBase, WorkerHandle};

/// Prefix of every field the build pipeline emits.
pub const FIELD_PREFIX: &str = "port-";

const QUEUE_CAPACITY: usize = 64;

/// Work item for the build worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRequest {
    Build(String),
    /// No more ports follow.
    Finish,
}

/// Feeding side of the build worker.
#[derive(Debug, Clone)]
pub struct BuildQueue {
    tx: mpsc::Sender<PortRequest>,
}

impl BuildQueue {
    /// Queue `port`. An empty name ends the queue, like [`BuildQueue::finish`].
    pub async fn push(&self, port: impl Into<String>) -> Result<()> {
        let port = port.into();
        let request = if port.is_empty() {
            PortRequest::Finish
        } else {
            PortRequest::Build(port)
        };
        self.send(request).await
    }

    pub async fn finish(&self) -> Result<()> {
        self.send(PortRequest::Finish).await
    }

    async fn send(&self, request: PortRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| CiError::Worker("build worker is no longer accepting ports".to_string()))
    }
}

/// Builds queued ports one after another.
pub struct BuildWorker {
    base: WorkerBase<BuildStatus>,
    tool: Arc<dyn BuildTool>,
    queue: mpsc::Receiver<PortRequest>,
    status: BuildStatus,
    /// Subport builds started so far; numbers the scratch files.
    builds: u64,
}

impl BuildWorker {
    /// Spawn the worker. The handle resolves to the aggregate status once the
    /// queue is finished (or every [`BuildQueue`] is dropped).
    pub fn start(
        context: Arc<RunContext>,
        tool: Arc<dyn BuildTool>,
    ) -> (BuildQueue, WorkerHandle<BuildStatus>) {
        let (tx, queue) = mpsc::channel(QUEUE_CAPACITY);
        let handle = WorkerBase::spawn(context, move |base| {
            let worker = BuildWorker {
                base,
                tool,
                queue,
                status: BuildStatus::default(),
                builds: 0,
            };
            worker.run()
        });
        (BuildQueue { tx }, handle)
    }

    async fn run(mut self) {
        let mut built = 0usize;
        while let Some(request) = self.queue.recv().await {
            match request {
                PortRequest::Build(port) => {
                    self.build_port(&port).await;
                    built += 1;
                }
                PortRequest::Finish => break,
            }
        }

        info!(
            ports = built,
            status = self.status.code(),
            "Build worker finished"
        );
        let status = self.status;
        self.base.complete(status);
    }

    async fn build_port(&mut self, port: &str) {
        info!(port, "Building port");
        let subports = match self.tool.list_subports(port).await {
            Ok(subports) => subports,
            Err(e) => {
                warn!(port, error = %e, "Failed to list subports");
                self.status.fail();
                self.emit(TextEvent::new(field(port, "subports-fail"), e.to_string()))
                    .await;
                return;
            }
        };

        let listing: String = subports.iter().map(|s| format!("{s}\n")).collect();
        self.emit(TextEvent::new(field(port, "subports"), listing))
            .await;

        for subport in &subports {
            self.build_subport(subport).await;
        }
    }

    async fn build_subport(&mut self, subport: &str) {
        self.builds += 1;
        let build = self.builds;
        let work_dir = self.base.context().work_dir().to_path_buf();
        let port_dir = work_dir.join(subport);

        if let Err(e) = self.tool.deactivate_all().await {
            debug!(subport, error = %e, "Deactivating active ports failed, continuing");
        }
        if let Err(e) = self.tool.cleanup(subport, &port_dir).await {
            debug!(subport, error = %e, "Cleanup failed, continuing");
        }

        let dep_log = scratch_path(&work_dir, subport, build, "dep-install.log");
        self.emit(TextEvent::new(field(subport, "dep-install-start"), Vec::new()))
            .await;
        let deps = self
            .run_stage(
                MpbbCommand::InstallDependencies,
                "dep-install",
                subport,
                &port_dir,
                &dep_log,
            )
            .await;
        let dep_summary = claim_summary(
            &summary_path(&port_dir, "dependencies-progress.txt"),
            scratch_path(&work_dir, subport, build, "dep-summary.txt"),
        )
        .await;
        self.emit(FileEvent::small(
            field(subport, &format!("dep-summary-{deps}")),
            dep_summary,
        ))
        .await;

        if !deps.is_success() {
            self.status.fail();
            self.emit(FileEvent::new(
                field(subport, "dep-install-output-fail"),
                dep_log,
                SizeClass::Big,
            ))
            .await;
            info!(subport, "Dependencies failed, skipping install");
            return;
        }
        remove_log(&dep_log).await;

        let install_log = scratch_path(&work_dir, subport, build, "install.log");
        self.emit(TextEvent::new(field(subport, "install-start"), Vec::new()))
            .await;
        let install = self
            .run_stage(
                MpbbCommand::InstallPort,
                "install",
                subport,
                &port_dir,
                &install_log,
            )
            .await;
        self.status.record(install);
        let install_summary = claim_summary(
            &summary_path(&port_dir, "ports-progress.txt"),
            scratch_path(&work_dir, subport, build, "install-summary.txt"),
        )
        .await;
        self.emit(FileEvent::small(
            field(subport, &format!("install-summary-{install}")),
            install_summary,
        ))
        .await;
        self.emit(FileEvent::new(
            field(subport, &format!("install-output-{install}")),
            install_log,
            SizeClass::Big,
        ))
        .await;
        info!(subport, status = %install, "Subport built");
    }

    /// Run one stage. A tool error is a failed stage with an extra
    /// `-error` part carrying the message.
    async fn run_stage(
        &mut self,
        command: MpbbCommand,
        stage: &str,
        subport: &str,
        port_dir: &Path,
        log: &Path,
    ) -> StageStatus {
        debug!(subport, %command, "Running stage");
        match self.tool.run_to_log(command, subport, port_dir, log).await {
            Ok(status) => status,
            Err(e) => {
                warn!(subport, %command, error = %e, "Build stage could not run");
                self.emit(TextEvent::new(
                    field(subport, &format!("{stage}-error")),
                    e.to_string(),
                ))
                .await;
                StageStatus::Fail
            }
        }
    }

    async fn emit(&self, event: impl Into<LogEvent>) {
        let event = event.into();
        let name = event.field().to_string();
        if let Err(e) = self.base.context().log().send(event).await {
            warn!(field = %name, error = %e, "Log aggregator rejected event");
        }
    }
}

/// `port-<name>-<suffix>`
pub fn field(name: &str, suffix: &str) -> String {
    format!("{FIELD_PREFIX}{name}-{suffix}")
}

fn summary_path(port_dir: &Path, file: &str) -> PathBuf {
    port_dir.join("logs").join(file)
}

/// `<work>/port-<subport>-<build>-<name>`. Unique per build, so a subport
/// built twice in one run never touches files already handed off.
fn scratch_path(work_dir: &Path, subport: &str, build: u64, name: &str) -> PathBuf {
    work_dir.join(format!("{FIELD_PREFIX}{subport}-{build}-{name}"))
}

/// Move an `mpbb` summary out of the port's work dir, which the next build
/// of the same subport cleans up. A missing summary stays missing and the
/// aggregator drops the event.
async fn claim_summary(summary: &Path, dest: PathBuf) -> PathBuf {
    if let Err(e) = tokio::fs::rename(summary, &dest).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %summary.display(), error = %e, "Failed to claim summary");
        }
    }
    dest
}

async fn remove_log(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove log");
        }
    }
}
