//! Test verdicts.
//!
//! The reporter sits after the runner: `AppTester → runner → TestReporter`.
//! It watches the launcher output while the app runs, then folds the
//! execution result, the listener state, the result file and any new crash
//! reports into one [`TestVerdict`] plus a message.

pub mod formatter;
pub mod parser;

pub use formatter::{FailureReport, print_report, write_failure};
pub use parser::ResultSummary;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::bundle::AppBundleInformation;
use crate::config::XmlResultJargon;
use crate::core::error::Result;
use crate::crash::CrashSnapshotReporter;
use crate::listener::ListenerHandle;
use crate::logs::{Log, LogKind, Logs, Subscription};
use crate::process::{ExecutionResult, ProcessManager};
use crate::target::TestTarget;
use crate::xml::Element;

const DID_NOT_WAIT: &str = "MT1111: ";
const LAUNCH_ERROR: &str = "error MT1007";
const TCP_CONNECTION_FAILED: &str = "Couldn't establish a TCP connection with any of the hostnames";

const CRASH_WAIT_FAILED: Duration = Duration::from_secs(5);
const CRASH_WAIT_CRASHED: Duration = Duration::from_secs(30);

/// Final classification of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestVerdict {
    /// Nothing decided yet.
    #[default]
    Finished,
    Succeeded,
    Failed,
    Crashed,
    /// The payload started but did not finish in time.
    TimedOut,
    /// The payload never reported in before the deadline.
    LaunchTimedOut,
    LaunchFailure,
}

impl TestVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, TestVerdict::Succeeded)
    }
}

impl fmt::Display for TestVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestVerdict::Finished => "Finished",
            TestVerdict::Succeeded => "Succeeded",
            TestVerdict::Failed => "Failed",
            TestVerdict::Crashed => "Crashed",
            TestVerdict::TimedOut => "TimedOut",
            TestVerdict::LaunchTimedOut => "LaunchTimedOut",
            TestVerdict::LaunchFailure => "LaunchFailure",
        };
        f.write_str(name)
    }
}

/// What a test run amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub verdict: TestVerdict,
    pub message: String,
    pub listener_connected: bool,
}

/// Everything a [`TestReporter`] needs to judge one run.
pub struct ReporterParts {
    pub processes: Arc<dyn ProcessManager>,
    /// Orchestrator log.
    pub main_log: Log,
    /// Launcher output.
    pub run_log: Log,
    pub logs: Arc<Logs>,
    pub listener: ListenerHandle,
    /// Where the listener writes what the payload reports.
    pub test_log: PathBuf,
    pub crashes: CrashSnapshotReporter,
    pub app: AppBundleInformation,
    pub target: TestTarget,
    pub device_name: String,
    pub jargon: XmlResultJargon,
    pub timeout: Duration,
    pub launch_timeout: Duration,
    /// Externally produced logs to attach to the results.
    pub additional_logs: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct RunState {
    did_not_wait: bool,
    launch_failure: bool,
    timed_out: bool,
    success: Option<bool>,
}

enum ParsedLog {
    Summary { line: String, failed: bool },
    Unreadable,
}

/// Verdict engine for one test run.
pub struct TestReporter {
    processes: Arc<dyn ProcessManager>,
    main_log: Log,
    run_log: Log,
    logs: Arc<Logs>,
    listener: ListenerHandle,
    test_log: PathBuf,
    crashes: tokio::sync::Mutex<CrashSnapshotReporter>,
    app: AppBundleInformation,
    target: TestTarget,
    device_name: String,
    jargon: XmlResultJargon,
    timeout: Duration,
    launch_timeout: Duration,
    additional_logs: Option<PathBuf>,
    started: Instant,
    crash_waits: (Duration, Duration),
    state: Arc<Mutex<RunState>>,
    _watch: Subscription,
}

impl TestReporter {
    /// Create the reporter and start watching the launcher output.
    pub fn new(parts: ReporterParts) -> Self {
        let state = Arc::new(Mutex::new(RunState::default()));

        let watched = state.clone();
        let watch = parts.run_log.on_line(move |line| {
            if line.contains(DID_NOT_WAIT) {
                lock(&watched).did_not_wait = true;
            } else if line.contains(LAUNCH_ERROR) {
                lock(&watched).launch_failure = true;
            }
        });

        Self {
            processes: parts.processes,
            main_log: parts.main_log,
            run_log: parts.run_log,
            logs: parts.logs,
            listener: parts.listener,
            test_log: parts.test_log,
            crashes: tokio::sync::Mutex::new(parts.crashes),
            app: parts.app,
            target: parts.target,
            device_name: parts.device_name,
            jargon: parts.jargon,
            timeout: parts.timeout,
            launch_timeout: parts.launch_timeout,
            additional_logs: parts.additional_logs,
            started: Instant::now(),
            crash_waits: (CRASH_WAIT_FAILED, CRASH_WAIT_CRASHED),
            state,
            _watch: watch,
        }
    }

    /// How long to wait for crash reports after a failed and after a crashed run.
    pub fn with_crash_waits(mut self, failed: Duration, crashed: Duration) -> Self {
        self.crash_waits = (failed, crashed);
        self
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        lock(&self.state)
    }

    /// Whether the launcher run succeeded, once collected.
    pub fn run_succeeded(&self) -> Option<bool> {
        self.state().success
    }

    /// Snapshot the crash store. Must happen before the app is launched.
    pub async fn start_crash_capture(&self) -> Result<()> {
        self.crashes.lock().await.start_capture().await
    }

    /// Outcome of the race between the listener connecting and the launch timeout.
    pub fn launch_callback(&self, connected: bool) {
        if connected {
            self.main_log.write_line("Test run started");
            return;
        }
        self.state().timed_out = true;
        self.main_log.write_line(format!(
            "Test failed to start in {} minute(s).",
            minutes(self.launch_timeout)
        ));
    }

    pub async fn collect_simulator_result(&self, result: &ExecutionResult) {
        self.collect_result(result, true).await;
    }

    pub async fn collect_device_result(&self, result: &ExecutionResult) {
        self.collect_result(result, false).await;
    }

    async fn collect_result(&self, result: &ExecutionResult, kill_on_failure: bool) {
        let mut timed_out = result.timed_out;

        let did_not_wait = self.state().did_not_wait;
        if did_not_wait && !timed_out {
            self.main_log
                .write_line("Waiting for listener to complete, since the launcher won't tell.");
            let remaining = self.timeout.saturating_sub(self.started.elapsed());
            if tokio::time::timeout(remaining, self.listener.completed()).await.is_err() {
                timed_out = true;
            }
        }

        let success = if timed_out {
            self.main_log.write_line(format!(
                "Test run timed out after {} minute(s).",
                minutes(self.timeout)
            ));
            false
        } else if result.succeeded() {
            self.main_log.write_line("Test run completed");
            true
        } else {
            self.main_log.write_line("Test run failed");
            false
        };

        {
            let mut state = self.state();
            state.timed_out |= timed_out;
            state.success = Some(success);
        }

        if !success && kill_on_failure {
            match self.app_pid() {
                Some(pid) => {
                    self.main_log
                        .write_line(format!("Killing process tree of {}", pid));
                    if let Err(e) = self.processes.kill_tree(pid, &self.main_log).await {
                        tracing::warn!(pid, error = %e, "failed to kill app process tree");
                    }
                }
                None => self.main_log.write_line("Could not find pid in launcher output."),
            }
        }
    }

    fn app_pid(&self) -> Option<u32> {
        let lines = self.run_log.lines().unwrap_or_default();
        parser::scan_run_log(&lines).pid.or_else(|| {
            self.main_log
                .contents()
                .ok()
                .and_then(|text| parser::pid_from_main_log(&text))
        })
    }

    /// Decide the verdict. Never fails: every problem ends up in the message.
    pub async fn parse_result(&self) -> TestOutcome {
        let connected = self.listener.is_connected();
        let run_lines = self.run_log.lines().unwrap_or_default();
        let run_scan = parser::scan_run_log(&run_lines);
        let run_log_empty = run_lines.iter().all(|l| l.trim().is_empty());

        let (timed_out, launch_failure) = {
            let state = self.state();
            (
                state.timed_out,
                state.launch_failure || run_scan.launch_failure || (run_log_empty && !connected),
            )
        };

        let parsed = if has_content(&self.test_log) {
            Some(self.parse_test_log())
        } else {
            None
        };

        let timeout_verdict = if connected {
            TestVerdict::TimedOut
        } else {
            TestVerdict::LaunchTimedOut
        };

        let (verdict, mut message) = match &parsed {
            Some(ParsedLog::Summary { line, failed }) => {
                let verdict = if *failed {
                    TestVerdict::Failed
                } else {
                    TestVerdict::Succeeded
                };
                (verdict, line.clone())
            }
            Some(ParsedLog::Unreadable) if timed_out => (timeout_verdict, "Test run timed out".to_string()),
            Some(ParsedLog::Unreadable) => (TestVerdict::Crashed, "Test run crashed".to_string()),
            None if timed_out && !connected => (timeout_verdict, "Test runner never started".to_string()),
            None if timed_out => (
                timeout_verdict,
                format!("Test run timed out after {} minute(s).", minutes(self.timeout)),
            ),
            None if launch_failure => (TestVerdict::LaunchFailure, "Test runner failed to launch".to_string()),
            None => (TestVerdict::Crashed, "No test log file was produced".to_string()),
        };

        let wait = match verdict {
            TestVerdict::Succeeded => Duration::ZERO,
            TestVerdict::Crashed => self.crash_waits.1,
            _ => self.crash_waits.0,
        };
        let reports = self.end_crash_capture(wait).await;

        let crash_reason = if verdict.is_success() {
            None
        } else {
            self.crash_reason(&reports)
        };
        if let Some(reason) = &crash_reason {
            message = reason.clone();
        }

        let has_results = matches!(parsed, Some(ParsedLog::Summary { .. }));
        if !verdict.is_success() && !has_results && self.jargon != XmlResultJargon::Missing {
            self.write_failures(verdict, &message, crash_reason.as_deref());
        }

        tracing::info!(%verdict, message = %message, "test run finished");
        self.main_log.write_line(format!("Test run result: {} ({})", verdict, message));

        TestOutcome {
            verdict,
            message,
            listener_connected: connected,
        }
    }

    /// Close the crash capture of a run whose launch errored out.
    pub async fn launch_aborted(&self) -> Vec<PathBuf> {
        self.main_log.write_line("Launch aborted, collecting crash reports");
        self.end_crash_capture(self.crash_waits.0).await
    }

    async fn end_crash_capture(&self, wait: Duration) -> Vec<PathBuf> {
        match self.crashes.lock().await.end_capture(wait).await {
            Ok(reports) => reports,
            Err(e) => {
                self.main_log
                    .write_line(format!("Failed to collect crash reports: {}", e));
                Vec::new()
            }
        }
    }

    fn parse_test_log(&self) -> ParsedLog {
        let Some(jargon) = parser::detect_jargon(&self.test_log) else {
            return self.parse_text();
        };
        match self.parse_xml(jargon) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.main_log
                    .write_line(format!("Could not parse xml result file: {}", e));
                self.dump_test_log();
                self.parse_text()
            }
        }
    }

    fn parse_text(&self) -> ParsedLog {
        let text = std::fs::read_to_string(&self.test_log).unwrap_or_default();
        match parser::scan_text(&text) {
            (Some(line), failed) => ParsedLog::Summary { line, failed },
            (None, _) => ParsedLog::Unreadable,
        }
    }

    fn parse_xml(&self, jargon: XmlResultJargon) -> Result<ParsedLog> {
        let cleaned = parser::cleaned_path(&self.test_log);
        parser::clean(&self.test_log, &cleaned)?;
        let mut root = Element::parse_file(&cleaned)?;
        let summary = parser::summarize(&root, jargon)?;

        let destination = if jargon == XmlResultJargon::NUnitV3 {
            parser::add_attachments(&mut root, &self.app.app_name, &self.attachments());
            parser::vsts_path(&parser::final_path(&cleaned, jargon))
        } else {
            parser::final_path(&cleaned, jargon)
        };
        root.write_file(&destination)?;
        if destination != cleaned {
            if let Err(e) = std::fs::remove_file(&cleaned) {
                tracing::debug!(path = %cleaned.display(), error = %e, "could not remove cleaned copy");
            }
        }
        self.logs.add_file(&destination, LogKind::XmlResult);

        Ok(ParsedLog::Summary {
            line: summary.to_string(),
            failed: summary.has_failures(),
        })
    }

    fn dump_test_log(&self) {
        let separator = "#".repeat(10);
        self.main_log.write_line(&separator);
        match std::fs::read_to_string(&self.test_log) {
            Ok(text) => {
                for line in text.lines() {
                    self.main_log.write_line(line);
                }
            }
            Err(e) => self.main_log.write_line(format!("Could not read test log: {}", e)),
        }
        self.main_log.write_line(&separator);
        self.main_log.write_line("End of xml results.");
    }

    /// Crash reports plus any externally supplied logs.
    fn attachments(&self) -> Vec<PathBuf> {
        let mut files = self.logs.entries_of(LogKind::Crash);
        if let Some(dir) = &self.additional_logs {
            match crate::util::fs::list_files(dir) {
                Ok(extra) => {
                    for path in extra {
                        self.logs.add_file(&path, LogKind::Build);
                        files.push(path);
                    }
                }
                Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "could not list additional logs"),
            }
        }
        files
    }

    fn crash_reason(&self, reports: &[PathBuf]) -> Option<String> {
        let pid = self.app_pid()?;
        for report in reports {
            let Ok(text) = std::fs::read_to_string(report) else {
                continue;
            };
            match parser::crash_reason(&text, pid) {
                Ok(Some(reason)) if reason == "per-process-limit" => {
                    return Some("Killed due to using too much memory (per-process-limit).".to_string());
                }
                Ok(Some(reason)) if !reason.is_empty() => {
                    return Some(format!("Killed by the OS ({})", reason));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(report = %report.display(), error = %e, "crash report is not JSON");
                }
            }
        }
        None
    }

    fn write_failures(&self, verdict: TestVerdict, message: &str, crash_reason: Option<&str>) {
        let variation = format!("{} ({})", self.device_name, self.target);
        let app = &self.app.app_name;
        let crashed_title = format!("{} crashed", app);
        let launch_title = format!("{} failed to launch", app);
        let timeout_title = format!("{} timed out", app);

        let mut failures: Vec<(&str, &str, &str)> = Vec::new();
        if let Some(reason) = crash_reason {
            failures.push(("crash", crashed_title.as_str(), reason));
        }
        if verdict == TestVerdict::LaunchFailure {
            failures.push(("launch", launch_title.as_str(), "Launch failure"));
        }
        if verdict == TestVerdict::Crashed && self.target.is_device() && self.mentions_tcp_failure() {
            failures.push(("tcp-connection", "TCP connection failed", TCP_CONNECTION_FAILED));
        }
        if matches!(verdict, TestVerdict::TimedOut | TestVerdict::LaunchTimedOut) {
            failures.push(("timeout", timeout_title.as_str(), message));
        }

        for (source, title, text) in failures {
            let report = FailureReport {
                source,
                app_name: app,
                variation: &variation,
                title,
                message: text,
                details: self.main_log.path(),
            };
            if let Err(e) = write_failure(&self.logs, self.jargon, &report) {
                self.main_log
                    .write_line(format!("Could not write {} failure result: {}", source, e));
            }
        }
    }

    fn mentions_tcp_failure(&self) -> bool {
        [&self.main_log, &self.run_log]
            .iter()
            .filter_map(|log| log.contents().ok())
            .any(|text| text.contains(TCP_CONNECTION_FAILED))
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn minutes(duration: Duration) -> String {
    format!("{}", duration.as_secs_f64() / 60.0)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
