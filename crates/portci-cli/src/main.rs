//! portci - MacPorts CI build runner
//!
//! ## Commands
//!
//! - `run`: build the given ports (or those changed since the base ref) and
//!   stream the log document to stdout
//! - `inspect`: list the parts of a saved log document

mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use portci::{changed_ports, BuildTool, CiError, MacPortsTool, PortList, RunnerConfig, Session};
use portci_log::{parse_document_detect, LogAggregator, Part};
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "portci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build MacPorts ports and stream their logs as one document", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build ports and write the log document to stdout
    Run(RunArgs),

    /// List the parts of a saved log document
    Inspect {
        /// Document file
        file: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Ports tree checkout used to detect changed ports
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Ref to diff against (default: macports/master)
    #[arg(long)]
    base: Option<String>,

    /// JSON config file overriding environment defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Paste service for oversized logs
    #[arg(long)]
    paste_url: Option<String>,

    /// Idle seconds before a keep-alive part is written
    #[arg(long)]
    keep_alive_secs: Option<u64>,

    /// Kill build stages running longer than this (0 = never)
    #[arg(long)]
    stage_timeout_secs: Option<u64>,

    /// Ports to build instead of the changed ones
    ports: Vec<String>,
}

impl RunArgs {
    fn apply(&self, mut config: RunnerConfig) -> RunnerConfig {
        if let Some(base) = &self.base {
            config.base_ref = base.clone();
        }
        if let Some(url) = &self.paste_url {
            config.log = config.log.with_paste_url(url.clone());
        }
        if let Some(secs) = self.keep_alive_secs {
            config.log = config.log.with_keep_alive_secs(secs);
        }
        if let Some(secs) = self.stage_timeout_secs {
            config.tool = config.tool.with_stage_timeout_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Inspect { file } => cmd_inspect(&file),
    }
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let config = RunnerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let config = args.apply(config);

    let ports: PortList = if args.ports.is_empty() {
        changed_ports(&args.repo, &config.base_ref)
            .await
            .with_context(|| format!("Failed to detect ports changed since {}", config.base_ref))?
    } else {
        args.ports.iter().cloned().collect()
    };

    let work_dir = tempfile::Builder::new()
        .prefix("ci-build-")
        .tempdir()
        .context("Failed to create work directory")?;

    let aggregator = LogAggregator::start(tokio::io::stdout(), config.log.clone())
        .context("Failed to start log aggregator")?;
    info!(
        ports = ports.len(),
        work_dir = %work_dir.path().display(),
        content_type = aggregator.content_type(),
        "Starting build run"
    );

    let tool: Arc<dyn BuildTool> = Arc::new(MacPortsTool::new(config.tool.clone()));
    let session = Session::new(work_dir.path(), ports, tool, aggregator.handle());
    let result = session.run().await;

    if let Err(e) = aggregator.close().await {
        warn!(error = %e, "Log aggregator closed early");
    }
    let finished = aggregator
        .wait()
        .await
        .context("Failed to finish log document")?;
    info!(
        parts = finished.summary.parts,
        pastebin_failed = finished.summary.pastebin_failed,
        "Log document complete"
    );

    work_dir
        .close()
        .context("Failed to remove work directory")?;

    match result {
        Ok(outcome) => {
            info!(ports = outcome.ports.len(), "Run succeeded");
            Ok(ExitCode::SUCCESS)
        }
        Err(CiError::RunFailed {
            lint_failed,
            build_failed,
        }) => {
            error!(lint_failed, build_failed, "Run failed");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("Run aborted"),
    }
}

fn cmd_inspect(file: &Path) -> Result<ExitCode> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let parts = parse_document_detect(&bytes)
        .with_context(|| format!("{} is not a log document", file.display()))?;

    for line in describe(&parts) {
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(parts: &[Part]) -> Vec<String> {
    parts
        .iter()
        .map(|part| format!("{:>10}  {}", part.body.len(), part.name))
        .collect()
}
