//! Launching apps on simulators, hardware devices and the host.
//!
//! [`AppRunner`] runs an app and reports the launcher's [`ExecutionResult`];
//! [`AppTester`] layers a test listener and a [`TestReporter`](crate::harness::TestReporter)
//! on top of the same launch paths, which live here in [`RunnerBase`].

pub mod app_runner;
pub mod app_tester;
pub mod installer;

pub use app_runner::AppRunner;
pub use app_tester::{AppTester, TestOptions};
pub use installer::{AppInstaller, SIMCTL_DEVICE_UNAVAILABLE};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bundle::AppBundleInformation;
use crate::config::Config;
use crate::core::error::Result;
use crate::crash::{CrashSnapshotReporter, CrashStore, DeviceCrashStore, LocalCrashStore};
use crate::device::{HardwareDevice, SimulatorDevice};
use crate::logs::capture::{
    CaptureLog, DESKTOP_SYSTEM_LOG, DeviceLogCapturer, LogStreamCapture, desktop_log_stream_command,
    simulator_log_stream_command,
};
use crate::logs::{Log, LogKind, Logs, Subscription};
use crate::process::{
    ExecutionResult, MlaunchArgument, MlaunchArguments, OutputSinks, ProcessCommand, ProcessManager,
};

/// Environment variable carrying the app-end tag.
pub const RUN_END_TAG: &str = "RUN_END_TAG";

const LSREGISTER: &str = "/System/Library/Frameworks/CoreServices.framework/Frameworks/LaunchServices.framework/Support/lsregister";

/// How long a system log capture waits for late writes when nothing was captured.
const CAPTURE_SETTLE: Duration = Duration::from_secs(2);

const CRASH_WAIT_FAILED: Duration = Duration::from_secs(5);

/// A resolved place to run an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Simulator {
        device: SimulatorDevice,
        /// The phone a watch simulator is paired with.
        companion: Option<SimulatorDevice>,
    },
    Hardware {
        device: HardwareDevice,
        companion: Option<HardwareDevice>,
    },
    /// The host itself (Mac Catalyst).
    Desktop,
}

impl RunTarget {
    pub fn name(&self) -> &str {
        match self {
            RunTarget::Simulator { device, .. } => &device.name,
            RunTarget::Hardware { device, .. } => &device.name,
            RunTarget::Desktop => "localhost",
        }
    }

    pub fn is_simulator(&self) -> bool {
        matches!(self, RunTarget::Simulator { .. })
    }
}

/// Caller choices for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Block until the app exits instead of returning once it launched.
    pub wait_for_exit: bool,
    /// Have the app print a per-run tag before it exits and stop waiting
    /// when the tag shows up.
    pub signal_app_end: bool,
    pub extra_args: Vec<String>,
    pub extra_env: Vec<(String, String)>,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.timeouts.run(),
            wait_for_exit: config.run.wait_for_exit,
            signal_app_end: config.run.signal_app_end,
            extra_args: Vec::new(),
            extra_env: Vec::new(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Environment handed to the app, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppEnvironment(Vec<(String, String)>);

impl AppEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable the framework relies on, replacing any earlier value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Append caller variables. Names already set by the framework keep
    /// their value and the duplicate is dropped.
    pub fn add_extra(&mut self, extra: &[(String, String)], log: &Log) {
        for (name, value) in extra {
            if self.get(name).is_some() {
                log.write_line(format!(
                    "Environmental variable {} is already passed to the application to drive test run, skipping..",
                    name
                ));
                continue;
            }
            self.0.push((name.clone(), value.clone()));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `-setenv` launcher arguments.
    pub fn to_mlaunch(&self) -> impl Iterator<Item = MlaunchArgument> + '_ {
        self.0
            .iter()
            .map(|(n, v)| MlaunchArgument::set_env(n.clone(), v.clone()))
    }
}

/// Watches the app output for the per-run end tag.
///
/// When the tag shows up the launcher wait is cancelled and the result
/// reported as a clean exit.
pub struct AppEndSignal {
    tag: String,
    cancel: CancellationToken,
    seen: Arc<AtomicBool>,
    _scan: Subscription,
}

impl AppEndSignal {
    pub fn watch(app_log: &Log, parent: &CancellationToken) -> Self {
        let tag = uuid::Uuid::new_v4().to_string();
        let cancel = parent.child_token();
        let seen = Arc::new(AtomicBool::new(false));

        let token = cancel.clone();
        let flag = seen.clone();
        let scan = app_log.scan_once(tag.clone(), move || {
            flag.store(true, Ordering::SeqCst);
            token.cancel();
        });

        Self {
            tag,
            cancel,
            seen,
            _scan: scan,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Token to run the launcher under.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn detected(&self) -> bool {
        self.seen.load(Ordering::SeqCst)
    }

    /// Report a cancelled wait as a successful exit once the tag was seen.
    pub fn patch(&self, result: ExecutionResult, log: &Log) -> ExecutionResult {
        if !self.detected() {
            return result;
        }
        log.write_line("Detected test end tag in application's output");
        ExecutionResult::success()
    }
}

/// Append each extra argument as an `-argument`.
pub fn push_app_arguments(args: &mut MlaunchArguments, extra_args: &[String]) {
    for arg in extra_args {
        args.push(MlaunchArgument::AppArgument(arg.clone()));
    }
}

/// Fail early when a bundle path was given but is missing.
pub fn check_bundle(app: &AppBundleInformation) -> Result<()> {
    if app.app_path.as_os_str().is_empty() {
        return Ok(());
    }
    app.ensure_exists()
}

/// Launch machinery shared by [`AppRunner`] and [`AppTester`].
#[derive(Clone)]
pub struct RunnerBase {
    pub(crate) processes: Arc<dyn ProcessManager>,
    pub(crate) logs: Arc<Logs>,
    pub(crate) main_log: Log,
    pub(crate) cancel: CancellationToken,
    crash_directory: PathBuf,
    detached: TaskTracker,
}

impl RunnerBase {
    pub fn new(
        processes: Arc<dyn ProcessManager>,
        logs: Arc<Logs>,
        main_log: Log,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            processes,
            logs,
            main_log,
            cancel: cancel.clone(),
            crash_directory: LocalCrashStore::default_directory(),
            detached: TaskTracker::new(),
        }
    }

    /// Give launchers left running by no-wait launches `limit` to exit.
    ///
    /// Returns false when some are still running afterwards.
    pub async fn wait_for_detached(&self, limit: Duration) -> bool {
        if self.detached.is_empty() {
            return true;
        }
        self.detached.close();
        let finished = tokio::time::timeout(limit, self.detached.wait()).await.is_ok();
        self.detached.reopen();
        if !finished {
            tracing::warn!(running = self.detached.len(), "detached launchers still running");
            self.main_log.write_line(format!(
                "{} launcher(s) still running after {:?}",
                self.detached.len(),
                limit
            ));
        }
        finished
    }

    /// Where local (simulator and desktop) crash reports are looked for.
    pub fn with_crash_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.crash_directory = directory.into();
        self
    }

    /// Crash reporter matching where the app runs.
    pub fn crash_reporter(&self, target: &RunTarget) -> CrashSnapshotReporter {
        let store: Box<dyn CrashStore> = match target {
            RunTarget::Hardware { device, .. } => Box::new(DeviceCrashStore::new(
                self.processes.clone(),
                self.logs.clone(),
                self.main_log.clone(),
                device.name.clone(),
                &self.cancel,
            )),
            RunTarget::Simulator { .. } | RunTarget::Desktop => Box::new(LocalCrashStore::new(
                self.crash_directory.clone(),
                self.logs.clone(),
            )),
        };
        CrashSnapshotReporter::new(store, self.logs.clone(), self.main_log.clone())
    }

    /// Log of the launcher and app output for one run.
    pub fn create_app_log(&self, app: &AppBundleInformation, target: &RunTarget) -> Result<Log> {
        self.logs.create(
            &format!("{}-{}.log", app.app_name, target.name()),
            LogKind::Application,
            true,
        )
    }

    /// Wait for crash reports after a run and log what was found.
    pub async fn end_crash_capture(&self, crashes: &mut CrashSnapshotReporter, result: &ExecutionResult) {
        let wait = if result.succeeded() {
            Duration::ZERO
        } else {
            CRASH_WAIT_FAILED
        };
        if let Err(e) = crashes.end_capture(wait).await {
            self.main_log
                .write_line(format!("Failed to collect crash reports: {}", e));
        }
    }

    /// Launch on a simulator (and its companion) with system log capture.
    pub async fn run_simulator_app(
        &self,
        app: &AppBundleInformation,
        simulator: &SimulatorDevice,
        companion: Option<&SimulatorDevice>,
        args: &MlaunchArguments,
        app_log: &Log,
        options: &RunOptions,
    ) -> Result<ExecutionResult> {
        let mut captures = Vec::new();
        for sim in std::iter::once(simulator).chain(companion) {
            let destination = self
                .logs
                .create_file(&format!("{}.log", sim.name), LogKind::System, true);
            let capture = CaptureLog::new(destination, sim.system_log(), false);
            capture.start_capture();
            captures.push(capture);
        }

        let mut booted = simulator.clone();
        booted
            .boot(self.processes.as_ref(), &self.main_log, &self.cancel)
            .await?;

        let stream_log = self.logs.create(
            &format!("{}-{}-stream.log", app.process_name(), simulator.name),
            LogKind::System,
            true,
        )?;
        let stream = match LogStreamCapture::start(
            self.processes.as_ref(),
            simulator_log_stream_command(self.processes.as_ref(), &simulator.udid, app.process_name()),
            &stream_log,
            &self.cancel,
        )
        .await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                self.main_log
                    .write_line(format!("Failed to start the simulator log stream: {}", e));
                None
            }
        };

        self.main_log.write_line(format!(
            "*** Executing '{}' on simulator '{}' ***",
            app.app_name, simulator.name
        ));
        let command = self
            .processes
            .mlaunch_command(args)
            .timeout(options.timeout);
        let sinks = OutputSinks::new(self.main_log.clone(), app_log.clone(), app_log.clone());
        let result = if options.wait_for_exit {
            self.processes
                .execute(command, sinks, self.cancel.clone())
                .await
        } else {
            self.launch_without_waiting(command, sinks, &app.bundle_identifier, app_log)
                .await
        };

        if let Some(stream) = stream {
            stream.stop().await;
        }
        for capture in &captures {
            if let Err(e) = capture.stop_capture(Some(CAPTURE_SETTLE)).await {
                self.main_log
                    .write_line(format!("Failed to capture {}: {}", capture.path().display(), e));
            }
        }
        result
    }

    /// Race the launcher's "launched" line against its exit.
    ///
    /// The scan and the process handle are released on both paths.
    async fn launch_without_waiting(
        &self,
        command: ProcessCommand,
        sinks: OutputSinks,
        bundle_id: &str,
        app_log: &Log,
    ) -> Result<ExecutionResult> {
        let (launched_tx, launched_rx) = oneshot::channel();
        let scan = app_log.scan_once(format!("Launched {} with pid", bundle_id), move || {
            let _ = launched_tx.send(());
        });

        let running = self
            .processes
            .spawn(command, sinks, self.cancel.child_token())
            .await?;
        let mut completion = running.completion;

        tokio::select! {
            Ok(()) = launched_rx => {}
            result = &mut completion => {
                drop(scan);
                return result;
            }
        }
        drop(scan);

        self.main_log
            .write_line("Launch confirmed, not waiting for the app to exit");
        let log = self.main_log.clone();
        self.detached.spawn(async move {
            match completion.await {
                Ok(r) => {
                    tracing::debug!(exit_code = r.exit_code, "detached launcher exited");
                    log.write_line(format!("Launcher exited with {}", r.exit_code));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "detached launcher failed");
                    log.write_line(format!("Launcher failed: {}", e));
                }
            }
        });
        Ok(ExecutionResult::success())
    }

    /// Launch on a hardware device with device log capture.
    ///
    /// With `app_end`, the launcher wait runs under the signal's token and a
    /// detected tag turns the cancelled result into a clean exit.
    pub async fn run_device_app(
        &self,
        app: &AppBundleInformation,
        device: &HardwareDevice,
        args: &MlaunchArguments,
        app_log: &Log,
        capturer: &mut dyn DeviceLogCapturer,
        app_end: Option<&AppEndSignal>,
        options: &RunOptions,
    ) -> Result<ExecutionResult> {
        if let Err(e) = capturer.start_capture().await {
            self.main_log
                .write_line(format!("Failed to start device log capture: {}", e));
        }

        self.main_log.write_line(format!(
            "*** Executing '{}' on device '{}' ***",
            app.app_name, device.name
        ));
        let cancel = app_end
            .map(AppEndSignal::token)
            .unwrap_or_else(|| self.cancel.clone());
        let command = self
            .processes
            .mlaunch_command(args)
            .timeout(options.timeout);
        let sinks = OutputSinks::new(self.main_log.clone(), app_log.clone(), app_log.clone());
        let result = self.processes.execute(command, sinks, cancel).await;

        if let Err(e) = capturer.stop_capture().await {
            self.main_log
                .write_line(format!("Failed to stop device log capture: {}", e));
        }

        let result = result?;
        Ok(match app_end {
            Some(signal) => signal.patch(result, &self.main_log),
            None => result,
        })
    }

    /// Launch a desktop bundle with `open`, streaming the host log meanwhile.
    pub async fn run_desktop_app(
        &self,
        app: &AppBundleInformation,
        env: &AppEnvironment,
        app_log: &Log,
        options: &RunOptions,
    ) -> Result<ExecutionResult> {
        let executable = app.desktop_executable();
        if executable.exists() {
            if let Err(e) = crate::util::fs::make_executable(&executable) {
                self.main_log
                    .write_line(format!("Failed to make {} executable: {}", executable.display(), e));
            }
        }

        // Recently rebuilt bundles are not always known to launch services.
        let register = ProcessCommand::new(LSREGISTER)
            .arg("-f")
            .arg(app.launch_app_path.display().to_string())
            .timeout(Duration::from_secs(60));
        let registered = self
            .processes
            .execute(register, OutputSinks::single(&self.main_log), self.cancel.clone())
            .await?;
        if !registered.succeeded() {
            self.main_log.write_line(format!(
                "lsregister failed with {}, launching anyway",
                registered.exit_code
            ));
        }

        let system_log = CaptureLog::new(
            self.logs
                .create_file("MacCatalyst.system.log", LogKind::System, false),
            DESKTOP_SYSTEM_LOG,
            false,
        );
        system_log.start_capture();

        let stream_log = self
            .logs
            .create(&format!("{}-stream.log", app.process_name()), LogKind::System, true)?;
        let stream = LogStreamCapture::start(
            self.processes.as_ref(),
            desktop_log_stream_command(app.process_name()),
            &stream_log,
            &self.cancel,
        )
        .await;

        let mut command = ProcessCommand::new("/usr/bin/open").arg("-n");
        if options.wait_for_exit {
            command = command.arg("-W");
        }
        for (name, value) in env.iter() {
            command = command.arg("--env").arg(format!("{}={}", name, value));
        }
        command = command.arg(app.launch_app_path.display().to_string());
        if !options.extra_args.is_empty() {
            command = command.arg("--args").args(options.extra_args.iter().cloned());
        }
        let command = command.timeout(options.timeout);

        self.main_log
            .write_line(format!("*** Executing '{}' on the host ***", app.app_name));
        let sinks = OutputSinks::new(self.main_log.clone(), app_log.clone(), app_log.clone());
        let result = self
            .processes
            .execute(command, sinks, self.cancel.clone())
            .await;

        match stream {
            Ok(stream) => stream.stop().await,
            Err(e) => self
                .main_log
                .write_line(format!("Failed to stream the system log: {}", e)),
        }
        if let Err(e) = system_log.stop_capture(Some(CAPTURE_SETTLE)).await {
            self.main_log
                .write_line(format!("Failed to capture the system log: {}", e));
        }
        result
    }
}
