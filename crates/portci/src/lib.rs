//! portci - build workers and run coordination for MacPorts CI
//!
//! A run takes the ports changed on a branch, builds each of them (and their
//! subports) with `mpbb`, lints them with `port lint`, and reports every step
//! as a part of the log document assembled by [`portci_log`].
//!
//! - [`Session`] coordinates one run and is consumed by it
//! - [`BuildWorker`] builds queued ports sequentially
//! - [`BuildTool`] is the seam to the external tooling; [`MacPortsTool`]
//!   drives the real programs and [`fakes::ScriptedBuildTool`] scripts them

pub mod build_worker;
pub mod config;
mod error;
pub mod fakes;
pub mod portlist;
pub mod session;
pub mod tool;
pub mod worker;

pub use build_worker::{BuildQueue, BuildWorker, PortRequest};
pub use config::RunnerConfig;
pub use error::{CiError, Result, ToolError};
pub use portlist::{changed_ports, parse_changed_ports, PortList, DEFAULT_BASE_REF};
pub use session::{RunOutcome, Session, PORT_LIST_FIELD};
pub use tool::{BuildTool, LintReport, MacPortsTool, MpbbCommand, StageStatus, ToolConfig};
pub use worker::{BuildStatus, RunContext, WorkerBase, WorkerHandle};
