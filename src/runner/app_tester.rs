//! Test runs: the app launch of [`RunnerBase`] plus a result listener and
//! a [`TestReporter`] verdict.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::app_runner::{device_arguments, simulator_arguments};
use super::{AppEndSignal, AppEnvironment, RUN_END_TAG, RunOptions, RunTarget, RunnerBase, check_bundle};
use crate::bundle::AppBundleInformation;
use crate::config::{Config, ListenerTransport, XmlResultJargon};
use crate::core::error::Result;
use crate::harness::{ReporterParts, TestOutcome, TestReporter};
use crate::listener::{ListenerHandle, TunnelBore, create_listener, transport_for};
use crate::logs::capture::MlaunchDeviceLogCapturer;
use crate::logs::{Log, LogKind};
use crate::process::ExecutionResult;
use crate::target::TestTarget;

/// How long a connected listener gets to finish after the app exited.
const LISTENER_GRACE: Duration = Duration::from_secs(5);

/// Caller choices for one test run.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub run: RunOptions,
    /// How long the payload has to connect before the run counts as not started.
    pub launch_timeout: Duration,
    pub transport: ListenerTransport,
    pub use_tunnel: bool,
    pub jargon: XmlResultJargon,
    pub skipped_methods: Vec<String>,
    pub skipped_classes: Vec<String>,
    /// Directory of build logs to attach to NUnit v3 results.
    pub additional_logs: Option<PathBuf>,
}

impl TestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            run: RunOptions::from_config(config),
            launch_timeout: config.timeouts.launch(),
            transport: config.listener.transport,
            use_tunnel: config.listener.use_tunnel,
            jargon: config.listener.xml_jargon,
            skipped_methods: Vec::new(),
            skipped_classes: Vec::new(),
            additional_logs: None,
        }
    }
}

impl Default for TestOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Runs test apps and judges the outcome.
pub struct AppTester {
    base: RunnerBase,
    tunnels: Arc<TunnelBore>,
    crash_waits: Option<(Duration, Duration)>,
}

impl AppTester {
    pub fn new(base: RunnerBase) -> Self {
        let tunnels = Arc::new(TunnelBore::new(base.processes.clone()));
        Self {
            base,
            tunnels,
            crash_waits: None,
        }
    }

    /// Share one tunnel registry across testers of a session.
    pub fn with_tunnels(mut self, tunnels: Arc<TunnelBore>) -> Self {
        self.tunnels = tunnels;
        self
    }

    /// Override how long the reporter waits for crash reports.
    pub fn with_crash_waits(mut self, failed: Duration, crashed: Duration) -> Self {
        self.crash_waits = Some((failed, crashed));
        self
    }

    /// Run the tests in `app` on `run_target` and decide the verdict.
    ///
    /// Errors are reserved for a missing bundle, listener setup and
    /// unlaunchable bundles. Everything that goes wrong once the app runs is
    /// folded into the [`TestOutcome`].
    pub async fn test_app(
        &self,
        app: &AppBundleInformation,
        run_target: &RunTarget,
        target: &TestTarget,
        options: &TestOptions,
    ) -> Result<TestOutcome> {
        check_bundle(app)?;
        let base = &self.base;
        // The verdict needs the payload's report, so a test run always
        // waits for the app to exit.
        let options = &TestOptions {
            run: RunOptions {
                wait_for_exit: true,
                ..options.run.clone()
            },
            ..options.clone()
        };

        let test_log = base
            .logs
            .create(&format!("test-{}.log", target), LogKind::Test, true)?;
        let app_log = base.create_app_log(app, run_target)?;

        let transport = transport_for(target.run_mode(), run_target.is_simulator(), options.transport);
        let use_tunnel = options.use_tunnel && matches!(run_target, RunTarget::Hardware { .. });
        let results_file = match transport {
            ListenerTransport::File => base
                .logs
                .create_file(&format!("test-{}.xml", target), LogKind::Test, true),
            ListenerTransport::Tcp => PathBuf::new(),
        };

        let mut listener = create_listener(
            transport,
            &base.main_log,
            &test_log,
            &results_file,
            use_tunnel,
            &base.cancel,
        );
        let port = listener.initialize().await?;
        listener.start()?;
        let handle = listener.handle();

        let mut reporter = TestReporter::new(ReporterParts {
            processes: base.processes.clone(),
            main_log: base.main_log.clone(),
            run_log: app_log.clone(),
            logs: base.logs.clone(),
            listener: handle.clone(),
            test_log: test_log.path().map(Path::to_path_buf).unwrap_or_default(),
            crashes: base.crash_reporter(run_target),
            app: app.clone(),
            target: target.clone(),
            device_name: run_target.name().to_string(),
            jargon: options.jargon,
            timeout: options.run.timeout,
            launch_timeout: options.launch_timeout,
            additional_logs: options.additional_logs.clone(),
        });
        if let Some((failed, crashed)) = self.crash_waits {
            reporter = reporter.with_crash_waits(failed, crashed);
        }
        if let Err(e) = reporter.start_crash_capture().await {
            base.main_log
                .write_line(format!("Failed to start crash capture: {}", e));
        }

        let app_end = match run_target {
            RunTarget::Hardware { .. } if options.run.signal_app_end => {
                Some(AppEndSignal::watch(&app_log, &base.cancel))
            }
            _ => None,
        };
        let env = test_environment(
            run_target,
            transport,
            port,
            &results_file,
            use_tunnel,
            app_end.as_ref(),
            options,
            &base.main_log,
        );

        if use_tunnel {
            if let RunTarget::Hardware { device, .. } = run_target {
                let opened = self
                    .tunnels
                    .create(&device.name, port, &base.main_log, options.run.timeout, &base.cancel)
                    .await;
                listener.tunnel_opened(matches!(opened, Ok(true)));
                if let Err(e) = opened {
                    base.main_log
                        .write_line(format!("Failed to create the TCP tunnel: {}", e));
                }
            }
        }

        let result = self
            .launch(app, run_target, &env, &app_log, app_end.as_ref(), &reporter, &handle, options)
            .await;

        if use_tunnel {
            if let RunTarget::Hardware { device, .. } = run_target {
                self.tunnels.close(&device.name).await;
            }
        }

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                listener.stop().await;
                reporter.launch_aborted().await;
                return Err(e);
            }
        };

        match run_target {
            RunTarget::Hardware { .. } => reporter.collect_device_result(&result).await,
            RunTarget::Simulator { .. } | RunTarget::Desktop => {
                reporter.collect_simulator_result(&result).await
            }
        }

        if handle.is_connected() && !handle.is_finished() {
            let _ = tokio::time::timeout(LISTENER_GRACE, handle.completed()).await;
        }
        listener.stop().await;

        Ok(reporter.parse_result().await)
    }

    /// Run the tests of a Mac Catalyst bundle on the host.
    pub async fn test_desktop_app(&self, app: &AppBundleInformation, options: &TestOptions) -> Result<TestOutcome> {
        self.test_app(app, &RunTarget::Desktop, &TestTarget::mac_catalyst(), options)
            .await
    }

    /// Launch while racing the listener connection against the launch timeout.
    ///
    /// A launch timeout stops the listener, never the app.
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        app: &AppBundleInformation,
        run_target: &RunTarget,
        env: &AppEnvironment,
        app_log: &Log,
        app_end: Option<&AppEndSignal>,
        reporter: &TestReporter,
        handle: &ListenerHandle,
        options: &TestOptions,
    ) -> Result<ExecutionResult> {
        let run = self.start(app, run_target, env, app_log, app_end, &options.run);
        tokio::pin!(run);

        let connect = tokio::time::timeout(options.launch_timeout, handle.connected());
        tokio::pin!(connect);
        let mut watching = true;

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                connected = &mut connect, if watching => {
                    watching = false;
                    let connected = matches!(connected, Ok(true));
                    reporter.launch_callback(connected);
                    if !connected {
                        handle.stop();
                    }
                }
            }
        };

        if watching && handle.is_connected() {
            reporter.launch_callback(true);
        }
        result
    }

    async fn start(
        &self,
        app: &AppBundleInformation,
        run_target: &RunTarget,
        env: &AppEnvironment,
        app_log: &Log,
        app_end: Option<&AppEndSignal>,
        options: &RunOptions,
    ) -> Result<ExecutionResult> {
        let base = &self.base;
        match run_target {
            RunTarget::Simulator { device, companion } => {
                let args = simulator_arguments(app, device, env, options)?;
                base.run_simulator_app(app, device, companion.as_ref(), &args, app_log, options)
                    .await
            }
            RunTarget::Hardware { device, .. } => {
                let args = device_arguments(app, device, env, options)?;
                let device_log = base.logs.create(
                    &format!("device-{}.log", device.name),
                    LogKind::System,
                    true,
                )?;
                let mut capturer = MlaunchDeviceLogCapturer::new(
                    base.processes.clone(),
                    device_log,
                    device.name.clone(),
                    &base.cancel,
                );
                base.run_device_app(app, device, &args, app_log, &mut capturer, app_end, options)
                    .await
            }
            RunTarget::Desktop => base.run_desktop_app(app, env, app_log, options).await,
        }
    }
}

/// Variables the test payload reads, followed by the caller's.
#[allow(clippy::too_many_arguments)]
fn test_environment(
    run_target: &RunTarget,
    transport: ListenerTransport,
    port: u16,
    results_file: &Path,
    use_tunnel: bool,
    app_end: Option<&AppEndSignal>,
    options: &TestOptions,
    log: &Log,
) -> AppEnvironment {
    let mut env = AppEnvironment::new();
    env.set("NUNIT_AUTOEXIT", "true");
    if transport == ListenerTransport::Tcp {
        env.set("NUNIT_HOSTPORT", port.to_string());
    }
    if options.jargon != XmlResultJargon::Missing {
        env.set("NUNIT_ENABLE_XML_OUTPUT", "true");
        env.set("NUNIT_XML_VERSION", options.jargon.to_string().to_lowercase());
    }
    if !options.skipped_methods.is_empty() || !options.skipped_classes.is_empty() {
        env.set("NUNIT_RUN_ALL", "false");
        if !options.skipped_methods.is_empty() {
            env.set("NUNIT_SKIPPED_METHODS", options.skipped_methods.join(","));
        }
        if !options.skipped_classes.is_empty() {
            env.set("NUNIT_SKIPPED_CLASSES", options.skipped_classes.join(","));
        }
    }
    if transport == ListenerTransport::File {
        env.set("NUNIT_LOG_FILE", results_file.display().to_string());
    }
    if use_tunnel {
        env.set("USE_TCP_TUNNEL", "true");
    }
    if let Some(signal) = app_end {
        env.set(RUN_END_TAG, signal.tag());
    }
    let hostname = match run_target {
        RunTarget::Hardware { .. } => crate::util::net::host_addresses_for_device(),
        RunTarget::Simulator { .. } | RunTarget::Desktop => "127.0.0.1".to_string(),
    };
    env.set("NUNIT_HOSTNAME", hostname);

    env.add_extra(&options.run.extra_env, log);
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;
    use crate::device::tests::{hardware, simulator};
    use crate::harness::TestVerdict;
    use crate::process::fake::FakeProcessManager;
    use crate::process::{OutputSinks, ProcessCommand};
    use crate::runner::tests::base;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use tokio::io::AsyncWriteExt;

    const PASSING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<assemblies>
  <assembly name="Tests.dll" total="3" passed="3" failed="0" skipped="0" errors="0" />
</assemblies>
"#;

    fn options(launch_timeout: Duration) -> TestOptions {
        TestOptions {
            run: RunOptions {
                timeout: Duration::from_secs(60),
                wait_for_exit: true,
                signal_app_end: false,
                extra_args: Vec::new(),
                extra_env: vec![("NUNIT_HOSTPORT".to_string(), "9999".to_string())],
            },
            launch_timeout,
            transport: ListenerTransport::Tcp,
            use_tunnel: false,
            jargon: XmlResultJargon::XUnit,
            skipped_methods: Vec::new(),
            skipped_classes: Vec::new(),
            additional_logs: None,
        }
    }

    fn env_arg(cmd: &ProcessCommand, name: &str) -> Option<String> {
        let prefix = format!("-setenv={}=", name);
        cmd.args
            .iter()
            .find_map(|a| a.strip_prefix(prefix.as_str()))
            .map(str::to_string)
    }

    fn is_launch(cmd: &ProcessCommand) -> bool {
        cmd.args
            .iter()
            .any(|a| a.starts_with("--launchsimbundleid") || a == "--launchdevbundleid")
    }

    /// A payload that connects to the advertised port and reports `PASSING`.
    fn reporting_payload(cmd: &ProcessCommand, _: &OutputSinks, _: tokio_util::sync::CancellationToken) -> BoxFuture<'static, ExecutionResult> {
        let port = if is_launch(cmd) {
            env_arg(cmd, "NUNIT_HOSTPORT").and_then(|p| p.parse::<u16>().ok())
        } else {
            None
        };
        async move {
            if let Some(port) = port {
                let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                stream.write_all(PASSING.as_bytes()).await.unwrap();
            }
            ExecutionResult::success()
        }
        .boxed()
    }

    fn sim_target(dir: &Path) -> RunTarget {
        let mut device = simulator("SIM-1", "com.apple.CoreSimulator.SimRuntime.iOS-17-0", "iPhone-15");
        device.log_path = dir.join("sim-logs");
        device.data_path = dir.join("sim-data");
        RunTarget::Simulator { device, companion: None }
    }

    #[tokio::test]
    async fn test_simulator_run_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let pm = Arc::new(FakeProcessManager::new(reporting_payload));
        let tester = AppTester::new(base(pm.clone(), dir.path())).with_crash_waits(Duration::ZERO, Duration::ZERO);
        let app = AppBundleInformation::from_bundle_id("com.example.tests");

        let outcome = tester
            .test_app(
                &app,
                &sim_target(dir.path()),
                &TestTarget::simulator(crate::target::OsFamily::IOS),
                &options(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.verdict, TestVerdict::Succeeded, "{}", outcome.message);
        assert!(outcome.listener_connected);
        assert!(outcome.message.contains("Tests run: 3"));

        let calls = pm.calls();
        let launch = calls.iter().find(|c| is_launch(c)).unwrap();
        let port = env_arg(launch, "NUNIT_HOSTPORT").unwrap();
        assert_ne!(port, "9999");
        assert_eq!(env_arg(launch, "NUNIT_HOSTNAME").as_deref(), Some("127.0.0.1"));
        assert_eq!(env_arg(launch, "NUNIT_XML_VERSION").as_deref(), Some("xunit"));
    }

    #[tokio::test]
    async fn test_silent_payload_is_launch_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pm = Arc::new(FakeProcessManager::new(|cmd, _, cancel| {
            let launch = is_launch(cmd);
            async move {
                if launch {
                    // Runs until the overall timeout would hit.
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(300)) => {}
                        _ = cancel.cancelled() => {}
                    }
                    return ExecutionResult::failed(137).with_timeout();
                }
                ExecutionResult::success()
            }
            .boxed()
        }));
        let tester = AppTester::new(base(pm.clone(), dir.path())).with_crash_waits(Duration::ZERO, Duration::ZERO);
        let app = AppBundleInformation::from_bundle_id("com.example.tests");

        let outcome = tester
            .test_app(
                &app,
                &sim_target(dir.path()),
                &TestTarget::simulator(crate::target::OsFamily::IOS),
                &options(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.verdict, TestVerdict::LaunchTimedOut);
        assert!(!outcome.listener_connected);
    }

    #[tokio::test]
    async fn test_no_wait_still_waits_for_the_payload_report() {
        let dir = tempfile::tempdir().unwrap();
        let pm = Arc::new(FakeProcessManager::new(|cmd, sinks, _| {
            let port = if is_launch(cmd) {
                sinks.stdout.write_line("Launched com.example.tests with pid 321");
                env_arg(cmd, "NUNIT_HOSTPORT").and_then(|p| p.parse::<u16>().ok())
            } else {
                None
            };
            async move {
                if let Some(port) = port {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                    stream.write_all(PASSING.as_bytes()).await.unwrap();
                }
                ExecutionResult::success()
            }
            .boxed()
        }));
        let tester = AppTester::new(base(pm.clone(), dir.path())).with_crash_waits(Duration::ZERO, Duration::ZERO);
        let app = AppBundleInformation::from_bundle_id("com.example.tests");
        let mut opts = options(Duration::from_secs(30));
        opts.run.wait_for_exit = false;

        let outcome = tester
            .test_app(
                &app,
                &sim_target(dir.path()),
                &TestTarget::simulator(crate::target::OsFamily::IOS),
                &opts,
            )
            .await
            .unwrap();

        assert_eq!(outcome.verdict, TestVerdict::Succeeded, "{}", outcome.message);
        assert!(outcome.listener_connected);
        assert!(outcome.message.contains("Tests run: 3"));
    }

    #[tokio::test]
    async fn test_launch_error_still_collects_crash_reports() {
        let dir = tempfile::tempdir().unwrap();
        let crashes = dir.path().join("crashes");
        std::fs::create_dir_all(&crashes).unwrap();
        let report = crashes.join("MyTests.ips");
        let pm = Arc::new(
            FakeProcessManager::always(ExecutionResult::success()).failing_spawn(move |cmd| {
                if is_launch(cmd) {
                    std::fs::write(&report, "{}").unwrap();
                    return true;
                }
                false
            }),
        );
        let tester = AppTester::new(base(pm.clone(), dir.path())).with_crash_waits(Duration::ZERO, Duration::ZERO);
        let app = AppBundleInformation::from_bundle_id("com.example.tests");

        let result = tester
            .test_app(
                &app,
                &sim_target(dir.path()),
                &TestTarget::simulator(crate::target::OsFamily::IOS),
                &options(Duration::from_secs(30)),
            )
            .await;

        assert!(result.is_err());
        let collected = tester.base.logs.entries_of(LogKind::Crash);
        assert_eq!(collected.len(), 1);
        assert!(collected[0].ends_with("MyTests.ips"));
    }

    #[test]
    fn test_environment_for_tunneled_device() {
        let target = RunTarget::Hardware {
            device: hardware("iPhone", DeviceClass::IPhone, "17.0"),
            companion: None,
        };
        let mut opts = options(Duration::from_secs(1));
        opts.skipped_classes = vec!["Slow".to_string(), "Flaky".to_string()];
        opts.jargon = XmlResultJargon::NUnitV3;
        let log = Log::memory();
        let env = test_environment(&target, ListenerTransport::Tcp, 1020, Path::new(""), true, None, &opts, &log);

        assert_eq!(env.get("NUNIT_HOSTPORT"), Some("1020"));
        assert_eq!(env.get("USE_TCP_TUNNEL"), Some("true"));
        assert_eq!(env.get("NUNIT_RUN_ALL"), Some("false"));
        assert_eq!(env.get("NUNIT_SKIPPED_CLASSES"), Some("Slow,Flaky"));
        assert_eq!(env.get("NUNIT_SKIPPED_METHODS"), None);
        assert_eq!(env.get("NUNIT_XML_VERSION"), Some("nunitv3"));
        assert!(env.get("NUNIT_HOSTNAME").is_some());
        assert!(log.contents().unwrap().contains("NUNIT_HOSTPORT is already passed"));
    }

    #[test]
    fn test_environment_for_file_transport() {
        let target = RunTarget::Desktop;
        let mut opts = options(Duration::from_secs(1));
        opts.jargon = XmlResultJargon::Missing;
        let env = test_environment(
            &target,
            ListenerTransport::File,
            0,
            Path::new("/tmp/results.xml"),
            false,
            None,
            &opts,
            &Log::memory(),
        );
        assert_eq!(env.get("NUNIT_LOG_FILE"), Some("/tmp/results.xml"));
        assert_eq!(env.get("NUNIT_ENABLE_XML_OUTPUT"), None);
        assert_eq!(env.get("NUNIT_HOSTNAME"), Some("127.0.0.1"));
        // Without a port the caller's value goes through untouched.
        assert_eq!(env.get("NUNIT_HOSTPORT"), Some("9999"));
    }
}
