//! Pieces shared by every worker of a run.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use portci_log::LogHandle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{CiError, Result};
use crate::portlist::PortList;
use crate::tool::StageStatus;

/// State of one run, shared read-only by its workers.
#[derive(Debug, Clone)]
pub struct RunContext {
    work_dir: PathBuf,
    ports: PortList,
    log: LogHandle,
}

impl RunContext {
    pub fn new(work_dir: impl Into<PathBuf>, ports: PortList, log: LogHandle) -> Self {
        Self {
            work_dir: work_dir.into(),
            ports,
            log,
        }
    }

    /// Root of all scratch files of the run.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn ports(&self) -> &PortList {
        &self.ports
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }
}

/// Aggregate build result. Once failed it stays failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildStatus {
    #[default]
    Success,
    Failure,
}

impl BuildStatus {
    pub fn record(&mut self, stage: StageStatus) {
        if !stage.is_success() {
            *self = BuildStatus::Failure;
        }
    }

    pub fn fail(&mut self) {
        *self = BuildStatus::Failure;
    }

    pub fn is_failure(self) -> bool {
        self == BuildStatus::Failure
    }

    /// Process-style status byte: 0 on success, 1 on failure.
    pub fn code(self) -> u8 {
        match self {
            BuildStatus::Success => 0,
            BuildStatus::Failure => 1,
        }
    }
}

/// What every worker holds: the run context and its completion signal.
pub struct WorkerBase<T> {
    context: Arc<RunContext>,
    done: oneshot::Sender<T>,
}

impl<T: Send + 'static> WorkerBase<T> {
    /// Spawn `body` with a fresh base; the returned handle resolves to the
    /// value passed to [`WorkerBase::complete`].
    pub fn spawn<F, Fut>(context: Arc<RunContext>, body: F) -> WorkerHandle<T>
    where
        F: FnOnce(WorkerBase<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done, result) = oneshot::channel();
        let task = tokio::spawn(body(WorkerBase { context, done }));
        WorkerHandle { result, task }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn complete(self, value: T) {
        // Nobody waiting is not an error.
        let _ = self.done.send(value);
    }
}

/// Completion side of a spawned worker.
pub struct WorkerHandle<T> {
    result: oneshot::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> WorkerHandle<T> {
    /// Wait for the worker's result and for its task to exit.
    pub async fn wait(self) -> Result<T> {
        match self.result.await {
            Ok(value) => {
                self.task
                    .await
                    .map_err(|e| CiError::Worker(e.to_string()))?;
                Ok(value)
            }
            Err(_) => match self.task.await {
                Err(e) => Err(CiError::Worker(e.to_string())),
                Ok(()) => Err(CiError::Worker(
                    "worker exited without reporting a result".to_string(),
                )),
            },
        }
    }
}
