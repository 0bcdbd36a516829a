//! Run coordinator.
//!
//! A [`Session`] records the port list, feeds the build worker and lints the
//! same ports while the build runs. It is single-shot: [`Session::run`]
//! consumes it.

use std::path::PathBuf;
use std::sync::Arc;

use portci_log::LogHandle;
use tracing::{info, warn};

use crate::build_worker::{field, BuildWorker};
use crate::error::{CiError, Result};
use crate::portlist::PortList;
use crate::tool::{BuildTool, StageStatus};
use crate::worker::{BuildStatus, RunContext};

/// Field of the part listing the ports of the run.
pub const PORT_LIST_FIELD: &str = "port-list";

/// Result of a run in which nothing failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub ports: PortList,
    pub build: BuildStatus,
    /// `None` when there was nothing to lint
    pub lint: Option<StageStatus>,
}

pub struct Session {
    context: Arc<RunContext>,
    tool: Arc<dyn BuildTool>,
}

impl Session {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        ports: PortList,
        tool: Arc<dyn BuildTool>,
        log: LogHandle,
    ) -> Self {
        Self {
            context: Arc::new(RunContext::new(work_dir, ports, log)),
            tool,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Build and lint every port, then report.
    ///
    /// Returns [`CiError::RunFailed`] when lint or any build stage failed.
    pub async fn run(self) -> Result<RunOutcome> {
        let ports = self.context.ports().clone();
        self.context
            .log()
            .text(PORT_LIST_FIELD, ports.to_text())
            .await?;

        if ports.is_empty() {
            info!("No ports to build");
            return Ok(RunOutcome {
                ports,
                build: BuildStatus::Success,
                lint: None,
            });
        }
        info!(count = ports.len(), work_dir = %self.context.work_dir().display(), "Starting run");

        let (queue, worker) = BuildWorker::start(self.context.clone(), self.tool.clone());
        let feed = ports.clone();
        let feeder = tokio::spawn(async move {
            for port in &feed {
                queue.push(port.as_str()).await?;
            }
            queue.finish().await
        });

        let lint = self.lint(ports.as_slice()).await;

        let fed = feeder
            .await
            .map_err(|e| CiError::Worker(e.to_string()))?;
        if let Err(e) = fed {
            warn!(error = %e, "Build queue closed early");
        }
        let build = worker.wait().await?;

        info!(
            build_status = build.code(),
            lint = %lint,
            "Run finished"
        );
        if build.is_failure() || !lint.is_success() {
            return Err(CiError::RunFailed {
                lint_failed: !lint.is_success(),
                build_failed: build.is_failure(),
            });
        }

        Ok(RunOutcome {
            ports,
            build,
            lint: Some(lint),
        })
    }

    async fn lint(&self, ports: &[String]) -> StageStatus {
        let (status, output) = match self.tool.lint(ports).await {
            Ok(report) => (StageStatus::from_success(report.success), report.output),
            Err(e) => {
                warn!(error = %e, "Lint could not run");
                (StageStatus::Fail, e.to_string().into_bytes())
            }
        };

        let name = field("lint", &format!("output-{status}"));
        if let Err(e) = self.context.log().text(name, output).await {
            warn!(error = %e, "Failed to record lint output");
        }
        status
    }
}
