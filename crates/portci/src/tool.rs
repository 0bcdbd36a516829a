//! The external build tooling: `port` for metadata and lint, `mpbb` for builds.
//!
//! Everything the build worker needs from the outside world goes through the
//! [`BuildTool`] trait so the pipeline can run against a scripted fake.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ToolError;

/// Outcome of one build stage; also the suffix of its field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStatus {
    Success,
    Fail,
}

impl StageStatus {
    pub fn from_success(success: bool) -> Self {
        if success {
            StageStatus::Success
        } else {
            StageStatus::Fail
        }
    }

    pub fn is_success(self) -> bool {
        self == StageStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `mpbb` sub-commands used by the build worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MpbbCommand {
    InstallDependencies,
    InstallPort,
    Cleanup,
}

impl MpbbCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            MpbbCommand::InstallDependencies => "install-dependencies",
            MpbbCommand::InstallPort => "install-port",
            MpbbCommand::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for MpbbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined lint output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintReport {
    pub output: Vec<u8>,
    pub success: bool,
}

#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Subports of `port`, the port itself included.
    async fn list_subports(&self, port: &str) -> Result<Vec<String>, ToolError>;

    /// Run `command` for `port`, appending stdout and stderr to `log_path`.
    async fn run_to_log(
        &self,
        command: MpbbCommand,
        port: &str,
        work_dir: &Path,
        log_path: &Path,
    ) -> Result<StageStatus, ToolError>;

    async fn cleanup(&self, port: &str, work_dir: &Path) -> Result<(), ToolError>;

    /// Deactivate every active port so the next build starts from a clean
    /// prefix. Installed images are kept for reuse as dependencies.
    async fn deactivate_all(&self) -> Result<(), ToolError>;

    async fn lint(&self, ports: &[String]) -> Result<LintReport, ToolError>;
}

/// Programs and limits for [`MacPortsTool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// `mpbb` executable
    pub mpbb: String,
    /// `port` executable
    pub port: String,
    /// Per-stage deadline in seconds, 0 for none
    pub stage_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            mpbb: "mpbb".to_string(),
            port: "port".to_string(),
            stage_timeout_secs: 0,
        }
    }
}

impl ToolConfig {
    pub fn with_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.stage_timeout_secs = secs;
        self
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }
}

/// [`BuildTool`] backed by the real `port` and `mpbb` programs.
#[derive(Debug, Clone, Default)]
pub struct MacPortsTool {
    config: ToolConfig,
}

impl MacPortsTool {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn mpbb_args(work_dir: &Path, command: MpbbCommand, port: &str) -> Vec<OsString> {
        vec![
            "--work-dir".into(),
            work_dir.as_os_str().to_owned(),
            command.as_str().into(),
            port.into(),
        ]
    }

    /// Run a program to completion, capturing its output.
    async fn capture(&self, program: &str, args: &[OsString]) -> Result<std::process::Output, ToolError> {
        debug!(program, ?args, "Running command");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                program: program.to_string(),
                source,
            })
    }
}

#[async_trait]
impl BuildTool for MacPortsTool {
    async fn list_subports(&self, port: &str) -> Result<Vec<String>, ToolError> {
        let args: Vec<OsString> = vec![
            "-q".into(),
            "info".into(),
            "--index".into(),
            "--line".into(),
            "--name".into(),
            port.into(),
            format!("subportof:{port}").into(),
        ];
        let output = self.capture(&self.config.port, &args).await?;
        if !output.status.success() {
            return Err(ToolError::Failed {
                command: display_command(&self.config.port, &args),
                code: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn run_to_log(
        &self,
        command: MpbbCommand,
        port: &str,
        work_dir: &Path,
        log_path: &Path,
    ) -> Result<StageStatus, ToolError> {
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?
            .into_std()
            .await;
        let stderr = log.try_clone()?;

        let args = Self::mpbb_args(work_dir, command, port);
        let rendered = display_command(&self.config.mpbb, &args);
        debug!(command = %rendered, log = %log_path.display(), "Starting build stage");

        let mut child = Command::new(&self.config.mpbb)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: self.config.mpbb.clone(),
                source,
            })?;

        let status = match self.config.stage_timeout() {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(command = %rendered, secs = limit.as_secs(), "Build stage timed out, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(command = %rendered, error = %e, "Failed to kill timed out stage");
                    }
                    return Err(ToolError::TimedOut {
                        command: rendered,
                        secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait().await?,
        };

        Ok(StageStatus::from_success(status.success()))
    }

    async fn cleanup(&self, port: &str, work_dir: &Path) -> Result<(), ToolError> {
        let args = Self::mpbb_args(work_dir, MpbbCommand::Cleanup, port);
        let output = self.capture(&self.config.mpbb, &args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(ToolError::Failed {
            command: display_command(&self.config.mpbb, &args),
            code: output.status.code(),
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn deactivate_all(&self) -> Result<(), ToolError> {
        let args: Vec<OsString> = vec!["deactivate".into(), "active".into()];
        let output = self.capture(&self.config.port, &args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(ToolError::Failed {
            command: display_command(&self.config.port, &args),
            code: output.status.code(),
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn lint(&self, ports: &[String]) -> Result<LintReport, ToolError> {
        let mut args: Vec<OsString> = vec!["-p".into(), "lint".into()];
        args.extend(ports.iter().map(OsString::from));

        let output = self.capture(&self.config.port, &args).await?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(LintReport {
            output: combined,
            success: output.status.success(),
        })
    }
}

fn display_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
