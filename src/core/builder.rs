use crate::bundle::AppBundleInformation;
use crate::config::{Config, ConfigLoader};
use crate::core::context::{Context, timestamp};
use crate::core::error::{Error, Result};
use crate::device::{HardwareDevice, HardwareDeviceRegistry, SimulatorDevice, SimulatorRegistry, SimulatorSelector};
use crate::harness::{TestOutcome, TestVerdict};
use crate::logs::{Log, LogKind};
use crate::process::{ExecutionResult, ProcessManager, TokioProcessManager};
use crate::runner::{AppRunner, AppTester, RunOptions, RunTarget, SIMCTL_DEVICE_UNAVAILABLE, TestOptions, check_bundle};
use crate::target::TestTarget;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a no-wait run lets its launcher settle before cleaning up.
const DETACHED_LAUNCHER_GRACE: Duration = Duration::from_secs(5);

/// Process exit code of a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Success,
    TestsFailed,
    PackageNotFound,
    PackageInstallationFailure,
    AppCrash,
    DeviceNotFound,
    ReturnCodeNotSet,
    AppLaunchFailure,
    AppLaunchTimeout,
    TimedOut,
    SimulatorFailure,
    GeneralFailure,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TestsFailed => 1,
            ExitCode::PackageNotFound => 2,
            ExitCode::TimedOut => 70,
            ExitCode::GeneralFailure => 71,
            ExitCode::PackageInstallationFailure => 78,
            ExitCode::AppCrash => 80,
            ExitCode::DeviceNotFound => 81,
            ExitCode::ReturnCodeNotSet => 82,
            ExitCode::AppLaunchFailure => 83,
            ExitCode::SimulatorFailure => 88,
            ExitCode::AppLaunchTimeout => 90,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == ExitCode::Success
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::TestsFailed => "TESTS_FAILED",
            ExitCode::PackageNotFound => "PACKAGE_NOT_FOUND",
            ExitCode::PackageInstallationFailure => "PACKAGE_INSTALLATION_FAILURE",
            ExitCode::AppCrash => "APP_CRASH",
            ExitCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            ExitCode::ReturnCodeNotSet => "RETURN_CODE_NOT_SET",
            ExitCode::AppLaunchFailure => "APP_LAUNCH_FAILURE",
            ExitCode::AppLaunchTimeout => "APP_LAUNCH_TIMEOUT",
            ExitCode::TimedOut => "TIMED_OUT",
            ExitCode::SimulatorFailure => "SIMULATOR_FAILURE",
            ExitCode::GeneralFailure => "GENERAL_FAILURE",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

impl From<TestVerdict> for ExitCode {
    fn from(verdict: TestVerdict) -> Self {
        match verdict {
            TestVerdict::Succeeded => ExitCode::Success,
            TestVerdict::Failed => ExitCode::TestsFailed,
            TestVerdict::Crashed => ExitCode::AppCrash,
            TestVerdict::LaunchFailure => ExitCode::AppLaunchFailure,
            TestVerdict::LaunchTimedOut => ExitCode::AppLaunchTimeout,
            TestVerdict::TimedOut => ExitCode::TimedOut,
            TestVerdict::Finished => ExitCode::GeneralFailure,
        }
    }
}

/// Exit code of a run that got as far as the app.
fn run_exit_code(result: &ExecutionResult, options: &RunOptions) -> ExitCode {
    if !options.wait_for_exit {
        return ExitCode::Success;
    }
    if result.timed_out {
        ExitCode::TimedOut
    } else if !result.succeeded() {
        ExitCode::AppLaunchFailure
    } else {
        ExitCode::Success
    }
}

/// What a test command amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub exit_code: ExitCode,
    /// `None` when the run never reached the app.
    pub outcome: Option<TestOutcome>,
}

impl From<ExitCode> for TestRun {
    fn from(exit_code: ExitCode) -> Self {
        Self {
            exit_code,
            outcome: None,
        }
    }
}

/// Builder for an [`Orchestrator`] session.
pub struct OrchestratorBuilder {
    config: Option<Config>,
    processes: Option<Arc<dyn ProcessManager>>,
    logs_directory: Option<PathBuf>,
    crash_directory: Option<PathBuf>,
    cancel: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: None,
            processes: None,
            logs_directory: None,
            crash_directory: None,
            cancel: None,
        }
    }

    /// Set the configuration directly.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Load configuration from `device-test-runner.toml` in the current
    /// directory (when present) plus environment overrides.
    pub fn load_config(mut self) -> Result<Self> {
        let config = ConfigLoader::new().base_dir(std::env::current_dir()?).load()?;
        self.config = Some(config);
        Ok(self)
    }

    /// Load configuration from a standalone TOML file plus environment overrides.
    pub fn from_config_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let config = ConfigLoader::new().config_file(path).load()?;
        self.config = Some(config);
        Ok(self)
    }

    /// Use a custom process backend instead of spawning real tools.
    pub fn process_manager(mut self, processes: Arc<dyn ProcessManager>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Override the configured log directory.
    pub fn logs_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.logs_directory = Some(path.into());
        self
    }

    /// Where local crash reports are looked for.
    pub fn crash_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.crash_directory = Some(path.into());
        self
    }

    /// Cancelling `token` stops every operation of the session.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Result<Orchestrator> {
        let mut config = self.config.ok_or_else(|| {
            Error::config("no configuration provided (call with_config, load_config or from_config_file)")
        })?;
        if let Some(dir) = self.logs_directory {
            config.logs.directory = dir;
        }

        let processes: Arc<dyn ProcessManager> = match self.processes {
            Some(pm) => pm,
            None => Arc::new(TokioProcessManager::from_config(&config.tools)),
        };

        let simulators = SimulatorRegistry::new(
            processes.clone(),
            SimulatorSelector::new(config.simulator.device_type.clone()),
        )
        .with_listing_timeout(config.timeouts.listing());
        let devices = HardwareDeviceRegistry::new(processes.clone());

        let mut ctx = Context::new(config, processes, self.cancel.unwrap_or_default())?;
        ctx.crash_directory = self.crash_directory;

        Ok(Orchestrator {
            ctx,
            simulators,
            devices,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One session: resolves devices and drives install, run, test and cleanup.
pub struct Orchestrator {
    ctx: Context,
    simulators: SimulatorRegistry,
    devices: HardwareDeviceRegistry,
}

impl Orchestrator {
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Every connected device.
    pub async fn list_devices(&self) -> Result<Vec<HardwareDevice>> {
        let run = &self.ctx.config.run;
        self.devices
            .load_devices(&self.ctx.main_log, run.include_locked, true, run.include_wireless, &self.ctx.cancel)
            .await?;
        Ok(self.devices.connected_devices().await)
    }

    /// Every simulator known to the host.
    pub async fn list_simulators(&self) -> Result<Vec<SimulatorDevice>> {
        self.simulators
            .load_devices(&self.ctx.main_log, true, &self.ctx.cancel)
            .await?;
        Ok(self.simulators.listing().await.devices)
    }

    /// Find the device (and companion) for `target`. `device_name` matches a
    /// name or identifier and skips automatic selection.
    pub async fn resolve(&self, target: &TestTarget, device_name: Option<&str>) -> Result<RunTarget> {
        if target.is_desktop() {
            return Ok(RunTarget::Desktop);
        }

        let log_name = format!("list-{}-{}.log", target, timestamp());
        let log = self.ctx.logs.create(&log_name, LogKind::Execution, false)?;
        self.ctx.main_log.write_line(format!(
            "Looking for available {} {}. Storing logs into {}",
            target,
            if target.is_simulator() { "simulators" } else { "devices" },
            log_name
        ));

        let resolved = if target.is_simulator() {
            self.resolve_simulator(target, device_name, &log).await
        } else {
            self.resolve_hardware(target, device_name, &log).await
        };
        log.flush();

        let resolved = resolved?;
        tracing::info!(device = resolved.name(), target = %target, "found device");
        Ok(resolved)
    }

    async fn resolve_simulator(&self, target: &TestTarget, device_name: Option<&str>, log: &Log) -> Result<RunTarget> {
        let cancel = &self.ctx.cancel;
        let sim_config = &self.ctx.config.simulator;

        let Some(name) = device_name else {
            let (device, companion) = self
                .simulators
                .find_simulators_with_retry(
                    target,
                    log,
                    sim_config.retry_count,
                    sim_config.create_if_needed,
                    false,
                    cancel,
                )
                .await?;
            return Ok(RunTarget::Simulator { device, companion });
        };

        self.simulators.load_devices(log, false, cancel).await?;
        let device = self
            .simulators
            .listing()
            .await
            .devices
            .into_iter()
            .find(|d| d.name == name || d.udid == name)
            .ok_or_else(|| Error::no_device(format!("Simulator '{}' not found", name)))?;
        let companion = if target.is_watch() {
            Some(self.simulators.find_companion_device(log, &device, cancel).await?)
        } else {
            None
        };
        Ok(RunTarget::Simulator { device, companion })
    }

    async fn resolve_hardware(&self, target: &TestTarget, device_name: Option<&str>, log: &Log) -> Result<RunTarget> {
        let cancel = &self.ctx.cancel;
        let run = &self.ctx.config.run;

        let device = match device_name {
            Some(name) => {
                self.devices
                    .load_devices(log, run.include_locked, false, run.include_wireless, cancel)
                    .await?;
                self.devices
                    .connected_devices()
                    .await
                    .into_iter()
                    .find(|d| d.name == name || d.device_identifier == name)
                    .ok_or_else(|| Error::no_device(format!("Device '{}' not found", name)))?
            }
            None => {
                self.devices
                    .find_device(target.run_mode(), log, run.include_locked, run.include_wireless, cancel)
                    .await?
            }
        };
        let companion = if target.is_watch() {
            Some(self.devices.find_companion_device(log, &device, cancel).await?)
        } else {
            None
        };
        Ok(RunTarget::Hardware { device, companion })
    }

    /// Install `app` onto the resolved device.
    pub async fn install(&self, app: &AppBundleInformation, target: &TestTarget, device_name: Option<&str>) -> ExitCode {
        let run_target = match self.prepare(app, target, device_name).await {
            Ok(t) => t,
            Err(code) => return code,
        };
        self.install_app(app, &run_target).await
    }

    /// Remove `app` from the resolved device.
    pub async fn uninstall(&self, app: &AppBundleInformation, target: &TestTarget, device_name: Option<&str>) -> ExitCode {
        match self.resolve(target, device_name).await {
            Ok(run_target) => self.uninstall_app(app, &run_target, false).await,
            Err(e) => self.failure(e),
        }
    }

    /// Install, run and uninstall `app`.
    pub async fn run(
        &self,
        app: &AppBundleInformation,
        target: &TestTarget,
        device_name: Option<&str>,
        options: &RunOptions,
    ) -> ExitCode {
        if target.is_desktop() {
            return self.run_desktop(app, options).await;
        }
        let run_target = match self.prepare(app, target, device_name).await {
            Ok(t) => t,
            Err(code) => return code,
        };
        let code = self.install_app(app, &run_target).await;
        if !code.is_success() {
            return code;
        }

        let base = self.ctx.runner_base();
        let runner = AppRunner::new(base.clone());
        let code = match runner.run_app(app, &run_target, options).await {
            Ok(result) => run_exit_code(&result, options),
            Err(e) => self.run_failure(e),
        };
        if !options.wait_for_exit {
            base.wait_for_detached(DETACHED_LAUNCHER_GRACE).await;
        }
        self.clean_up(app, &run_target, code).await
    }

    /// Run a Mac Catalyst app in place.
    pub async fn run_desktop(&self, app: &AppBundleInformation, options: &RunOptions) -> ExitCode {
        if let Err(e) = check_bundle(app) {
            return self.failure(e);
        }
        let runner = AppRunner::new(self.ctx.runner_base());
        match runner.run_desktop_app(app, options).await {
            Ok(result) => run_exit_code(&result, options),
            Err(e) => self.launch_failure(e),
        }
    }

    /// Install `app`, run its tests and uninstall it.
    pub async fn test(
        &self,
        app: &AppBundleInformation,
        target: &TestTarget,
        device_name: Option<&str>,
        options: &TestOptions,
    ) -> TestRun {
        if target.is_desktop() {
            return self.test_desktop(app, options).await;
        }
        let run_target = match self.prepare(app, target, device_name).await {
            Ok(t) => t,
            Err(code) => return code.into(),
        };
        let code = self.install_app(app, &run_target).await;
        if !code.is_success() {
            return code.into();
        }

        let tester = AppTester::new(self.ctx.runner_base());
        let run = match tester.test_app(app, &run_target, target, options).await {
            Ok(outcome) => TestRun {
                exit_code: outcome.verdict.into(),
                outcome: Some(outcome),
            },
            Err(e) => self.run_failure(e).into(),
        };
        TestRun {
            exit_code: self.clean_up(app, &run_target, run.exit_code).await,
            outcome: run.outcome,
        }
    }

    /// Run the tests of a Mac Catalyst app in place.
    pub async fn test_desktop(&self, app: &AppBundleInformation, options: &TestOptions) -> TestRun {
        if let Err(e) = check_bundle(app) {
            return self.failure(e).into();
        }
        let tester = AppTester::new(self.ctx.runner_base());
        match tester.test_desktop_app(app, options).await {
            Ok(outcome) => TestRun {
                exit_code: outcome.verdict.into(),
                outcome: Some(outcome),
            },
            Err(e) => self.launch_failure(e).into(),
        }
    }

    /// Resolve the device, reset simulators and drop any previous install.
    async fn prepare(
        &self,
        app: &AppBundleInformation,
        target: &TestTarget,
        device_name: Option<&str>,
    ) -> std::result::Result<RunTarget, ExitCode> {
        check_bundle(app).map_err(|e| self.failure(e))?;
        let mut run_target = self.resolve(target, device_name).await.map_err(|e| self.failure(e))?;

        let reset = self.ctx.config.simulator.reset;
        if let RunTarget::Simulator { device, companion } = &mut run_target {
            let bundle_ids: Vec<String> = [app.bundle_identifier.clone()]
                .into_iter()
                .filter(|id| !id.is_empty())
                .collect();
            for sim in std::iter::once(device).chain(companion.as_mut()) {
                tracing::info!(simulator = %sim.name, reset, "preparing simulator");
                match sim
                    .prepare(self.ctx.processes.clone(), &bundle_ids, reset, &self.ctx.main_log, &self.ctx.cancel)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(simulator = %sim.name, "permissions were not granted"),
                    Err(e) => {
                        tracing::error!(simulator = %sim.name, error = %e, "failed to prepare simulator");
                        return Err(ExitCode::SimulatorFailure);
                    }
                }
            }
        }

        if !reset || !run_target.is_simulator() {
            self.uninstall_app(app, &run_target, true).await;
        }
        Ok(run_target)
    }

    async fn install_app(&self, app: &AppBundleInformation, run_target: &RunTarget) -> ExitCode {
        tracing::info!(app = %app.app_name, device = run_target.name(), "installing application");
        let code = match self.ctx.installer().install(app, run_target, &self.ctx.cancel).await {
            Ok(result) if result.succeeded() => return ExitCode::Success,
            Ok(_) => ExitCode::PackageInstallationFailure,
            Err(Error::BundleNotFound(path)) => return self.failure(Error::BundleNotFound(path)),
            Err(e) => {
                tracing::error!(error = %e, "failed to install the app bundle");
                ExitCode::PackageInstallationFailure
            }
        };

        tracing::error!(app = %app.app_name, device = run_target.name(), "failed to install the application");
        if self.uninstall_app(app, run_target, false).await == ExitCode::SimulatorFailure {
            return ExitCode::SimulatorFailure;
        }
        code
    }

    /// A `preparation` uninstall clears a previous copy and its result does
    /// not matter.
    async fn uninstall_app(&self, app: &AppBundleInformation, run_target: &RunTarget, preparation: bool) -> ExitCode {
        let result = match self.ctx.installer().uninstall(app, run_target, &self.ctx.cancel).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "failed to uninstall the application");
                return ExitCode::GeneralFailure;
            }
        };
        if result.succeeded() {
            return ExitCode::Success;
        }
        if preparation {
            tracing::debug!(timed_out = result.timed_out, "preemptive uninstallation failed");
        } else if run_target.is_simulator() && result.exit_code == SIMCTL_DEVICE_UNAVAILABLE {
            tracing::error!("failed to uninstall the application, bad simulator state detected");
            return ExitCode::SimulatorFailure;
        } else {
            tracing::error!("failed to uninstall the app bundle, check logs for more details");
        }
        ExitCode::GeneralFailure
    }

    /// Uninstall after a run. A broken simulator outranks any failure other
    /// than failed tests.
    async fn clean_up(&self, app: &AppBundleInformation, run_target: &RunTarget, code: ExitCode) -> ExitCode {
        let uninstalled = self.uninstall_app(app, run_target, false).await;
        if uninstalled == ExitCode::SimulatorFailure && !matches!(code, ExitCode::Success | ExitCode::TestsFailed) {
            return ExitCode::SimulatorFailure;
        }
        code
    }

    fn failure(&self, e: Error) -> ExitCode {
        let code = match &e {
            Error::BundleNotFound(_) => ExitCode::PackageNotFound,
            e if e.is_no_device() => ExitCode::DeviceNotFound,
            _ => ExitCode::GeneralFailure,
        };
        self.ctx.main_log.write_line(e.to_string());
        tracing::error!(error = %e, exit_code = code.code(), "operation failed");
        code
    }

    fn run_failure(&self, e: Error) -> ExitCode {
        match e {
            Error::BundleNotFound(_) => self.failure(e),
            e => {
                self.ctx.main_log.write_line(format!("Application run failed:\n{}", e));
                tracing::error!(error = %e, "application run failed");
                ExitCode::GeneralFailure
            }
        }
    }

    fn launch_failure(&self, e: Error) -> ExitCode {
        self.ctx.main_log.write_line(format!("Application run failed:\n{}", e));
        tracing::error!(error = %e, "application run failed");
        ExitCode::AppLaunchFailure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{FakeProcessManager, arg_value, has_arg};
    use crate::target::OsFamily;

    const DEVICES: &str = r#"<MTouch>
  <Device>
    <DeviceIdentifier>phone-1</DeviceIdentifier>
    <DeviceClass>iPhone</DeviceClass>
    <Name>Phone</Name>
    <ProductVersion>17.0</ProductVersion>
  </Device>
</MTouch>"#;

    /// Lists one phone and answers every other command with `result`.
    fn device_host(result: ExecutionResult) -> Arc<FakeProcessManager> {
        Arc::new(FakeProcessManager::sync(move |cmd, _| {
            if let Some(path) = arg_value(cmd, "--listdev") {
                std::fs::write(path, DEVICES).unwrap();
                return ExecutionResult::success();
            }
            if arg_value(cmd, "--list-crash-reports").is_some() || has_arg(cmd, "--uninstalldevbundleid") {
                return ExecutionResult::success();
            }
            result
        }))
    }

    fn orchestrator(pm: Arc<FakeProcessManager>, dir: &std::path::Path) -> Orchestrator {
        OrchestratorBuilder::new()
            .with_config(Config::default())
            .logs_directory(dir.join("logs"))
            .crash_directory(dir.join("crashes"))
            .process_manager(pm)
            .build()
            .unwrap()
    }

    fn bundle(dir: &std::path::Path) -> AppBundleInformation {
        let path = dir.join("My.app");
        std::fs::create_dir_all(&path).unwrap();
        AppBundleInformation::from_app_path(path, "com.example.my")
    }

    #[test]
    fn test_builder_error_missing_config() {
        let result = OrchestratorBuilder::new().build();
        let err = result.err().expect("should fail");
        assert!(err.to_string().contains("no configuration"));
    }

    #[test]
    fn test_builder_overrides_logs_directory() {
        let dir = tempfile::tempdir().unwrap();
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let orchestrator = orchestrator(pm, dir.path());
        assert!(dir.path().join("logs").join("main.log").exists());
        assert_eq!(orchestrator.context().config.logs.directory, dir.path().join("logs"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::from(TestVerdict::Succeeded).code(), 0);
        assert_eq!(ExitCode::from(TestVerdict::Failed).code(), 1);
        assert_eq!(ExitCode::from(TestVerdict::Crashed).code(), 80);
        assert_eq!(ExitCode::from(TestVerdict::LaunchFailure).code(), 83);
        assert_eq!(ExitCode::from(TestVerdict::LaunchTimedOut).code(), 90);
        assert_eq!(ExitCode::from(TestVerdict::TimedOut).code(), 70);
        assert_eq!(ExitCode::SimulatorFailure.to_string(), "SIMULATOR_FAILURE (88)");
    }

    #[test]
    fn test_run_exit_code() {
        let waiting = RunOptions::default();
        assert_eq!(run_exit_code(&ExecutionResult::success(), &waiting), ExitCode::Success);
        assert_eq!(run_exit_code(&ExecutionResult::failed(1), &waiting), ExitCode::AppLaunchFailure);
        assert_eq!(
            run_exit_code(&ExecutionResult::failed(137).with_timeout(), &waiting),
            ExitCode::TimedOut
        );

        let detached = RunOptions {
            wait_for_exit: false,
            ..RunOptions::default()
        };
        assert_eq!(run_exit_code(&ExecutionResult::failed(1), &detached), ExitCode::Success);
    }

    #[tokio::test]
    async fn test_missing_bundle_is_package_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let orchestrator = orchestrator(pm.clone(), dir.path());
        let app = AppBundleInformation::from_app_path(dir.path().join("Missing.app"), "com.example.missing");
        let code = orchestrator
            .run(&app, &TestTarget::device(OsFamily::IOS), None, &RunOptions::default())
            .await;
        assert_eq!(code, ExitCode::PackageNotFound);
        assert!(pm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_listing_is_device_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::failed(1)));
        let orchestrator = orchestrator(pm, dir.path());
        let code = orchestrator
            .install(&bundle(dir.path()), &TestTarget::device(OsFamily::IOS), None)
            .await;
        assert_eq!(code, ExitCode::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_unknown_device_name_is_device_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(device_host(ExecutionResult::success()), dir.path());
        let code = orchestrator
            .uninstall(&bundle(dir.path()), &TestTarget::device(OsFamily::IOS), Some("Nope"))
            .await;
        assert_eq!(code, ExitCode::DeviceNotFound);
    }

    #[tokio::test]
    async fn test_run_on_device_installs_runs_and_uninstalls() {
        let dir = tempfile::tempdir().unwrap();
        let pm = device_host(ExecutionResult::success());
        let orchestrator = orchestrator(pm.clone(), dir.path());
        let code = orchestrator
            .run(&bundle(dir.path()), &TestTarget::device(OsFamily::IOS), Some("Phone"), &RunOptions::default())
            .await;
        assert_eq!(code, ExitCode::Success);

        let lines = pm.command_lines();
        let position = |needle: &str| lines.iter().position(|l| l.contains(needle)).unwrap();
        let install = position("--installdev");
        let launch = position("--launchdevbundleid com.example.my");
        assert!(position("--uninstalldevbundleid") < install);
        assert!(install < launch);
        assert!(lines.iter().rposition(|l| l.contains("--uninstalldevbundleid")).unwrap() > launch);
    }

    #[tokio::test]
    async fn test_failed_install_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let pm = device_host(ExecutionResult::failed(1));
        let orchestrator = orchestrator(pm.clone(), dir.path());
        let code = orchestrator
            .install(&bundle(dir.path()), &TestTarget::device(OsFamily::IOS), None)
            .await;
        assert_eq!(code, ExitCode::PackageInstallationFailure);
        assert!(!pm.command_lines().iter().any(|l| l.contains("--launchdevbundleid")));
    }

    #[tokio::test]
    async fn test_list_devices() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(device_host(ExecutionResult::success()), dir.path());
        let devices = orchestrator.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Phone");
    }
}
