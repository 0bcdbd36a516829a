//! Scripted build tool (testing only)
//!
//! `ScriptedBuildTool` answers every [`BuildTool`] call from a script instead
//! of spawning `port` or `mpbb`. Stages write a log and a summary file the way
//! `mpbb` does, so the files handed to the aggregator are real.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::error::ToolError;
use crate::tool::{BuildTool, LintReport, MpbbCommand, StageStatus};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    ListSubports(String),
    Run(MpbbCommand, String),
    Cleanup(String),
    DeactivateAll,
    Lint(Vec<String>),
}

#[derive(Debug, Clone)]
enum Scripted<T> {
    Ok(T),
    Err(String),
}

/// In-memory [`BuildTool`]. Unscripted ports have themselves as the only
/// subport and every unscripted stage succeeds.
#[derive(Debug)]
pub struct ScriptedBuildTool {
    subports: HashMap<String, Scripted<Vec<String>>>,
    stages: HashMap<(MpbbCommand, String), Scripted<StageStatus>>,
    lint: Scripted<LintReport>,
    lint_after: Option<(MpbbCommand, String)>,
    calls: Mutex<Vec<ToolCall>>,
    stage_ran: Notify,
}

impl Default for ScriptedBuildTool {
    fn default() -> Self {
        Self {
            subports: HashMap::new(),
            stages: HashMap::new(),
            lint: Scripted::Ok(LintReport {
                output: b"--->  Verifying Portfile\n".to_vec(),
                success: true,
            }),
            lint_after: None,
            calls: Mutex::new(Vec::new()),
            stage_ran: Notify::new(),
        }
    }
}

impl ScriptedBuildTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subports(mut self, port: &str, subports: &[&str]) -> Self {
        let subports = subports.iter().map(|s| s.to_string()).collect();
        self.subports.insert(port.to_string(), Scripted::Ok(subports));
        self
    }

    pub fn with_subports_error(mut self, port: &str, message: &str) -> Self {
        self.subports
            .insert(port.to_string(), Scripted::Err(message.to_string()));
        self
    }

    pub fn with_stage(mut self, command: MpbbCommand, port: &str, status: StageStatus) -> Self {
        self.stages
            .insert((command, port.to_string()), Scripted::Ok(status));
        self
    }

    /// Make `command` for `port` fail to run at all.
    pub fn with_stage_error(mut self, command: MpbbCommand, port: &str, message: &str) -> Self {
        self.stages
            .insert((command, port.to_string()), Scripted::Err(message.to_string()));
        self
    }

    pub fn with_lint(mut self, success: bool, output: &str) -> Self {
        self.lint = Scripted::Ok(LintReport {
            output: output.as_bytes().to_vec(),
            success,
        });
        self
    }

    pub fn with_lint_error(mut self, message: &str) -> Self {
        self.lint = Scripted::Err(message.to_string());
        self
    }

    /// Hold lint back until `command` has run for `port`. Only completes
    /// when lint and the build run side by side.
    pub fn with_lint_after(mut self, command: MpbbCommand, port: &str) -> Self {
        self.lint_after = Some((command, port.to_string()));
        self
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    /// `(command, port)` of every stage that ran.
    pub fn stages_run(&self) -> Vec<(MpbbCommand, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ToolCall::Run(command, port) => Some((command, port)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ToolCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn scripted_error(command: String, message: &str) -> ToolError {
    ToolError::Failed {
        command,
        code: Some(1),
        output: message.to_string(),
    }
}

#[async_trait]
impl BuildTool for ScriptedBuildTool {
    async fn list_subports(&self, port: &str) -> Result<Vec<String>, ToolError> {
        self.record(ToolCall::ListSubports(port.to_string()));
        match self.subports.get(port) {
            Some(Scripted::Ok(subports)) => Ok(subports.clone()),
            Some(Scripted::Err(message)) => {
                Err(scripted_error(format!("port info {port}"), message))
            }
            None => Ok(vec![port.to_string()]),
        }
    }

    async fn run_to_log(
        &self,
        command: MpbbCommand,
        port: &str,
        work_dir: &Path,
        log_path: &Path,
    ) -> Result<StageStatus, ToolError> {
        self.record(ToolCall::Run(command, port.to_string()));
        self.stage_ran.notify_waiters();
        let status = match self.stages.get(&(command, port.to_string())) {
            Some(Scripted::Ok(status)) => *status,
            Some(Scripted::Err(message)) => {
                return Err(ToolError::Spawn {
                    program: "mpbb".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()),
                });
            }
            None => StageStatus::Success,
        };

        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        log.write_all(format!("---> {command} {port}\n").as_bytes())
            .await?;
        log.write_all(format!("---> {port}: {status}\n").as_bytes())
            .await?;
        log.flush().await?;

        let summary = match command {
            MpbbCommand::InstallDependencies => "dependencies-progress.txt",
            _ => "ports-progress.txt",
        };
        let logs_dir = work_dir.join("logs");
        tokio::fs::create_dir_all(&logs_dir).await?;
        tokio::fs::write(logs_dir.join(summary), format!("{port} {status}\n")).await?;

        Ok(status)
    }

    async fn cleanup(&self, port: &str, work_dir: &Path) -> Result<(), ToolError> {
        self.record(ToolCall::Cleanup(port.to_string()));
        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn deactivate_all(&self) -> Result<(), ToolError> {
        self.record(ToolCall::DeactivateAll);
        Ok(())
    }

    async fn lint(&self, ports: &[String]) -> Result<LintReport, ToolError> {
        self.record(ToolCall::Lint(ports.to_vec()));
        if let Some((command, port)) = &self.lint_after {
            let awaited = ToolCall::Run(*command, port.clone());
            loop {
                let ran = self.stage_ran.notified();
                let done = self.calls.lock().unwrap().contains(&awaited);
                if done {
                    break;
                }
                ran.await;
            }
        }
        match &self.lint {
            Scripted::Ok(report) => Ok(report.clone()),
            Scripted::Err(message) => Err(scripted_error("port -p lint".to_string(), message)),
        }
    }
}
