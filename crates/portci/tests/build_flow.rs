//! Integration tests: a full run against the scripted build tool, with the
//! real log aggregator collecting the document.

use std::sync::Arc;
use std::time::Duration;

use portci::fakes::{ScriptedBuildTool, ToolCall};
use portci::{
    BuildStatus, BuildWorker, CiError, MpbbCommand, PortList, RunContext, RunOutcome, Session,
    StageStatus,
};
use portci_log::{parse_document_detect, LogAggregator, LogConfig, Part};
use tempfile::TempDir;

/// Paste endpoint that refuses connections, so every big log resolves to a
/// `-pastebin-fail` part without touching the network.
async fn log_config() -> LogConfig {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    LogConfig::default()
        .with_paste_url(format!("http://{addr}/"))
        .with_upload_attempts(1)
        .with_retry_backoff_ms(0)
}

struct RunResult {
    result: portci::Result<RunOutcome>,
    parts: Vec<Part>,
    work_dir: TempDir,
}

impl RunResult {
    fn names(&self) -> Vec<&str> {
        self.parts.iter().map(|p| p.name.as_str()).collect()
    }

    fn count(&self, name: &str) -> usize {
        self.parts.iter().filter(|p| p.name == name).count()
    }

    fn body(&self, name: &str) -> String {
        let part = self
            .parts
            .iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("no part named {name}: {:?}", self.names()));
        String::from_utf8_lossy(&part.body).into_owned()
    }
}

async fn run(tool: Arc<ScriptedBuildTool>, ports: &[&str]) -> RunResult {
    let work_dir = tempfile::Builder::new()
        .prefix("ci-build-")
        .tempdir()
        .unwrap();
    let aggregator = LogAggregator::start(Vec::new(), log_config().await).unwrap();

    let ports: PortList = ports.iter().copied().collect();
    let session = Session::new(work_dir.path(), ports, tool, aggregator.handle());
    let result = tokio::time::timeout(Duration::from_secs(30), session.run())
        .await
        .expect("run did not finish");

    aggregator.close().await.unwrap();
    let finished = aggregator.wait().await.unwrap();
    let parts = parse_document_detect(&finished.output).unwrap();
    RunResult {
        result,
        parts,
        work_dir,
    }
}

/// Test: dependency failure in one subport leaves its sibling alone
#[tokio::test]
async fn test_dependency_failure_skips_only_that_subport() {
    let tool = Arc::new(
        ScriptedBuildTool::new()
            .with_subports("foo", &["foo", "foo-devel"])
            .with_stage(MpbbCommand::InstallDependencies, "foo", StageStatus::Fail),
    );

    let run = run(tool.clone(), &["foo"]).await;
    let names = run.names();

    assert_eq!(names[0], "port-list");
    assert_eq!(run.body("port-list"), "foo\n");
    assert_eq!(run.body("port-foo-subports"), "foo\nfoo-devel\n");

    assert_eq!(run.count("port-foo-dep-summary-fail"), 1);
    assert_eq!(run.body("port-foo-dep-summary-fail"), "foo fail\n");
    assert_eq!(
        run.count("port-foo-dep-install-output-fail-pastebin-fail"),
        1
    );
    assert!(
        !names.iter().any(|n| n.starts_with("port-foo-install-")),
        "install stage ran after dependency failure: {names:?}"
    );

    assert_eq!(run.count("port-foo-devel-dep-summary-success"), 1);
    assert_eq!(run.count("port-foo-devel-install-summary-success"), 1);
    assert_eq!(
        run.count("port-foo-devel-install-output-success-pastebin-fail"),
        1
    );
    assert_eq!(run.count("port-lint-output-success"), 1);

    assert!(!tool
        .stages_run()
        .contains(&(MpbbCommand::InstallPort, "foo".to_string())));
    assert!(matches!(
        run.result,
        Err(CiError::RunFailed {
            lint_failed: false,
            build_failed: true
        })
    ));

    // Every log handed off was consumed, and the worker removed the
    // successful dependency log itself.
    let leftover_logs: Vec<_> = std::fs::read_dir(run.work_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .collect();
    assert!(leftover_logs.is_empty(), "left behind: {leftover_logs:?}");
}

/// Test: a subport built twice in one run keeps both builds' logs apart
#[tokio::test]
async fn test_repeated_subport_gets_separate_logs() {
    let tool = Arc::new(ScriptedBuildTool::new().with_subports("foo", &["foo", "bar"]));
    let run = run(tool.clone(), &["foo", "bar"]).await;

    let installs = tool
        .stages_run()
        .into_iter()
        .filter(|stage| *stage == (MpbbCommand::InstallPort, "bar".to_string()))
        .count();
    assert_eq!(installs, 2);

    assert_eq!(run.count("port-bar-install-start"), 2);
    assert_eq!(run.count("port-bar-dep-summary-success"), 2);
    let summaries: Vec<&[u8]> = run
        .parts
        .iter()
        .filter(|p| p.name == "port-bar-install-summary-success")
        .map(|p| p.body.as_slice())
        .collect();
    assert_eq!(summaries, [b"bar success\n".as_slice(), b"bar success\n".as_slice()]);

    // Each upload had its own file to read.
    let uploads: Vec<String> = run
        .parts
        .iter()
        .filter(|p| p.name == "port-bar-install-output-success-pastebin-fail")
        .map(|p| String::from_utf8_lossy(&p.body).into_owned())
        .collect();
    assert_eq!(uploads.len(), 2);
    assert!(
        uploads.iter().all(|body| !body.contains("failed to read log")),
        "{uploads:?}"
    );
    assert!(run.result.is_ok());

    let leftover_files: Vec<_> = std::fs::read_dir(run.work_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .collect();
    assert!(leftover_files.is_empty(), "left behind: {leftover_files:?}");
}

/// Test: every subport starts from deactivated ports and a clean work dir
#[tokio::test]
async fn test_ports_deactivated_before_each_subport() {
    let tool = Arc::new(ScriptedBuildTool::new().with_subports("zlib", &["zlib", "zlib-devel"]));
    let run = run(tool.clone(), &["zlib"]).await;
    assert!(run.result.is_ok());

    let build_calls: Vec<ToolCall> = tool
        .calls()
        .into_iter()
        .filter(|call| !matches!(call, ToolCall::Lint(_) | ToolCall::ListSubports(_)))
        .collect();
    assert_eq!(
        build_calls,
        [
            ToolCall::DeactivateAll,
            ToolCall::Cleanup("zlib".into()),
            ToolCall::Run(MpbbCommand::InstallDependencies, "zlib".into()),
            ToolCall::Run(MpbbCommand::InstallPort, "zlib".into()),
            ToolCall::DeactivateAll,
            ToolCall::Cleanup("zlib-devel".into()),
            ToolCall::Run(MpbbCommand::InstallDependencies, "zlib-devel".into()),
            ToolCall::Run(MpbbCommand::InstallPort, "zlib-devel".into()),
        ]
    );
}

/// Test: start markers precede the stages they announce
#[tokio::test]
async fn test_stage_parts_in_pipeline_order() {
    let tool = Arc::new(ScriptedBuildTool::new());
    let run = run(tool, &["zlib"]).await;

    let names: Vec<&str> = run
        .names()
        .into_iter()
        .filter(|n| n.starts_with("port-zlib-") && !n.ends_with("-pastebin-fail"))
        .collect();
    assert_eq!(
        names,
        [
            "port-zlib-subports",
            "port-zlib-dep-install-start",
            "port-zlib-dep-summary-success",
            "port-zlib-install-start",
            "port-zlib-install-summary-success",
        ]
    );
    assert!(run.result.is_ok());
}

/// Test: a failure is never cleared by later successes
#[tokio::test]
async fn test_status_stays_failed_after_later_successes() {
    let tool = Arc::new(
        ScriptedBuildTool::new().with_stage(MpbbCommand::InstallPort, "alpha", StageStatus::Fail),
    );

    let run = run(tool.clone(), &["alpha", "beta", "gamma"]).await;

    assert_eq!(run.count("port-alpha-install-output-fail-pastebin-fail"), 1);
    assert_eq!(run.count("port-beta-install-summary-success"), 1);
    assert_eq!(run.count("port-gamma-install-summary-success"), 1);
    assert!(matches!(
        run.result,
        Err(CiError::RunFailed {
            build_failed: true,
            ..
        })
    ));
}

/// Test: clean run reports its outcome
#[tokio::test]
async fn test_successful_run() {
    let tool = Arc::new(ScriptedBuildTool::new().with_lint(true, "0 errors and 0 warnings found.\n"));
    let run = run(tool.clone(), &["zlib", "xz"]).await;

    let outcome = run.result.as_ref().expect("run should succeed");
    assert_eq!(outcome.build, BuildStatus::Success);
    assert_eq!(outcome.lint, Some(StageStatus::Success));
    assert_eq!(outcome.ports.as_slice(), ["zlib", "xz"]);
    assert_eq!(
        run.body("port-lint-output-success"),
        "0 errors and 0 warnings found.\n"
    );
    assert!(tool
        .calls()
        .contains(&ToolCall::Lint(vec!["zlib".to_string(), "xz".to_string()])));
}

/// Test: a port whose subports cannot be listed does not stop the queue
#[tokio::test]
async fn test_subport_listing_failure_continues() {
    let tool = Arc::new(
        ScriptedBuildTool::new().with_subports_error("ghost", "Error: Port ghost not found"),
    );
    let run = run(tool.clone(), &["ghost", "zlib"]).await;

    assert!(run
        .body("port-ghost-subports-fail")
        .contains("Error: Port ghost not found"));
    assert_eq!(run.count("port-ghost-subports"), 0);
    assert_eq!(run.count("port-zlib-install-summary-success"), 1);
    assert!(!tool
        .stages_run()
        .iter()
        .any(|(_, port)| port == "ghost"));
    assert!(matches!(
        run.result,
        Err(CiError::RunFailed {
            build_failed: true,
            ..
        })
    ));
}

/// Test: a stage that cannot be started is a failure with an error part
#[tokio::test]
async fn test_stage_error_is_recorded() {
    let tool = Arc::new(ScriptedBuildTool::new().with_stage_error(
        MpbbCommand::InstallPort,
        "zlib",
        "mpbb: command not found",
    ));
    let run = run(tool, &["zlib"]).await;

    assert!(run
        .body("port-zlib-install-error")
        .contains("mpbb: command not found"));
    assert_eq!(run.count("port-zlib-install-output-fail-pastebin-fail"), 1);
    assert!(matches!(
        run.result,
        Err(CiError::RunFailed {
            build_failed: true,
            ..
        })
    ));
}

/// Test: lint runs beside the build, and its failure alone fails the run
#[tokio::test]
async fn test_lint_runs_concurrently_with_build() {
    // Lint only returns once the build has reached the install stage, so a
    // run that lints before building never finishes.
    let tool = Arc::new(
        ScriptedBuildTool::new()
            .with_lint(false, "Error: Portfile has trailing whitespace\n")
            .with_lint_after(MpbbCommand::InstallPort, "zlib"),
    );
    let run = run(tool, &["zlib"]).await;

    assert!(run
        .body("port-lint-output-fail")
        .contains("trailing whitespace"));
    assert!(matches!(
        run.result,
        Err(CiError::RunFailed {
            lint_failed: true,
            build_failed: false
        })
    ));
}

/// Test: lint that cannot run counts as a lint failure
#[tokio::test]
async fn test_lint_error_fails_run() {
    let tool = Arc::new(ScriptedBuildTool::new().with_lint_error("port: command not found"));
    let run = run(tool, &["zlib"]).await;

    assert!(run.body("port-lint-output-fail").contains("command not found"));
    assert!(matches!(
        run.result,
        Err(CiError::RunFailed {
            lint_failed: true,
            build_failed: false
        })
    ));
}

/// Test: nothing to build means nothing runs
#[tokio::test]
async fn test_empty_port_list() {
    let tool = Arc::new(ScriptedBuildTool::new());
    let run = run(tool.clone(), &[]).await;

    assert_eq!(run.names(), ["port-list"]);
    assert!(run.body("port-list").is_empty());
    let outcome = run.result.expect("empty run succeeds");
    assert_eq!(outcome.lint, None);
    assert!(tool.calls().is_empty());
}

/// Test: the build queue ends on an empty port name and rejects later work
#[tokio::test]
async fn test_build_queue_end_marker() {
    let work_dir = tempfile::tempdir().unwrap();
    let aggregator = LogAggregator::start(Vec::new(), log_config().await).unwrap();
    let context = Arc::new(RunContext::new(
        work_dir.path(),
        PortList::new(),
        aggregator.handle(),
    ));
    let tool = Arc::new(ScriptedBuildTool::new());

    let (queue, worker) = BuildWorker::start(context, tool.clone());
    queue.push("zlib").await.unwrap();
    queue.push("").await.unwrap();
    let status = worker.wait().await.unwrap();

    assert_eq!(status, BuildStatus::Success);
    assert!(queue.push("xz").await.is_err());
    assert_eq!(
        tool.calls()[0],
        ToolCall::ListSubports("zlib".to_string())
    );
    assert!(!tool.calls().contains(&ToolCall::ListSubports("xz".to_string())));

    drop(queue);
    let finished = aggregator.wait().await.unwrap();
    assert_eq!(finished.summary.pastebin, 0);
}
