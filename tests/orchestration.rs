//! End-to-end runs through the orchestrator against a scripted tool chain.

mod common;

use common::{ScriptedHost, app_bundle, arg_value, create_simulator_dirs, env_arg, is_simctl, simulator_listing};
use device_test_runner::bundle::AppBundleInformation;
use device_test_runner::config::Config;
use device_test_runner::harness::TestVerdict;
use device_test_runner::process::{ExecutionResult, ProcessCommand};
use device_test_runner::runner::{RunOptions, TestOptions};
use device_test_runner::target::{OsFamily, TestTarget};
use device_test_runner::{ExitCode, Orchestrator, builder};
use futures::FutureExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const PASSING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<assemblies>
  <assembly name="Tests.dll" total="4" passed="4" failed="0" skipped="0" errors="0" />
</assemblies>
"#;

fn is_sim_launch(cmd: &ProcessCommand) -> bool {
    cmd.args.iter().any(|a| a.starts_with("--launchsimbundleid="))
}

fn orchestrator(host: Arc<ScriptedHost>, root: &Path) -> Orchestrator {
    let mut config = Config::default();
    config.timeouts.run = 60;
    config.timeouts.launch = 30;
    builder()
        .with_config(config)
        .logs_directory(root.join("logs"))
        .crash_directory(root.join("crashes"))
        .process_manager(host)
        .build()
        .unwrap()
}

/// A simulator host whose test payload reports `PASSING` over TCP.
fn reporting_simulator_host(root: &Path) -> Arc<ScriptedHost> {
    let listing = simulator_listing(root);
    ScriptedHost::new(move |cmd, _, _| {
        if let Some(path) = arg_value(cmd, "--listsim") {
            std::fs::write(path, &listing).unwrap();
        }
        let port = if is_sim_launch(cmd) {
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
    })
}

#[tokio::test]
async fn test_simulator_test_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    create_simulator_dirs(dir.path());
    let host = reporting_simulator_host(dir.path());
    let orchestrator = orchestrator(host.clone(), dir.path());

    let app = AppBundleInformation::from_app_path(app_bundle(dir.path(), "MyTests"), "com.example.tests");
    let mut options = TestOptions::from_config(&orchestrator.context().config);
    options.run.extra_env = vec![("CUSTOM".to_string(), "1".to_string())];

    let run = orchestrator
        .test(&app, &TestTarget::simulator(OsFamily::IOS), None, &options)
        .await;

    let outcome = run.outcome.expect("the run reached the app");
    assert_eq!(outcome.verdict, TestVerdict::Succeeded, "{}", outcome.message);
    assert!(outcome.message.contains("Tests run: 4"), "{}", outcome.message);
    assert_eq!(run.exit_code, ExitCode::Success);

    let calls = host.calls();
    let launch = calls.iter().find(|c| is_sim_launch(c)).unwrap();
    assert_eq!(env_arg(launch, "CUSTOM").as_deref(), Some("1"));
    assert_eq!(env_arg(launch, "NUNIT_AUTOEXIT").as_deref(), Some("true"));
    assert!(launch.args.iter().any(|a| a == "--device=:v2:udid=SIM-1"));

    let lines = host.command_lines();
    let first = |needle: &str| lines.iter().position(|l| l.contains(needle)).unwrap();
    let install = first("--installsim");
    let launch = first("--launchsimbundleid=com.example.tests");
    assert!(first("simctl privacy SIM-1 grant") < install);
    assert!(first("simctl uninstall SIM-1 com.example.tests") < install);
    assert!(install < launch);
    assert!(lines.iter().rposition(|l| l.contains("simctl uninstall")).unwrap() > launch);

    let logs = dir.path().join("logs");
    assert!(logs.join("main.log").exists());
    assert!(
        std::fs::read_dir(&logs)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("test-ios-simulator-64"))
    );
}

#[tokio::test]
async fn test_broken_simulator_uninstall() {
    let dir = tempfile::tempdir().unwrap();
    let listing = simulator_listing(dir.path());
    let host = ScriptedHost::sync(move |cmd, _| {
        if let Some(path) = arg_value(cmd, "--listsim") {
            std::fs::write(path, &listing).unwrap();
        }
        if is_simctl(cmd, "uninstall") {
            return ExecutionResult::failed(165);
        }
        ExecutionResult::success()
    });
    let orchestrator = orchestrator(host.clone(), dir.path());

    let code = orchestrator
        .uninstall(
            &AppBundleInformation::from_bundle_id("com.example.tests"),
            &TestTarget::simulator(OsFamily::IOS),
            Some("Test iPhone"),
        )
        .await;
    assert_eq!(code, ExitCode::SimulatorFailure);
    assert_eq!(code.code(), 88);
}

#[tokio::test]
async fn test_failed_simulator_install_skips_launch() {
    let dir = tempfile::tempdir().unwrap();
    create_simulator_dirs(dir.path());
    let listing = simulator_listing(dir.path());
    let host = ScriptedHost::sync(move |cmd, _| {
        if let Some(path) = arg_value(cmd, "--listsim") {
            std::fs::write(path, &listing).unwrap();
        }
        if cmd.args.iter().any(|a| a == "--installsim") {
            return ExecutionResult::failed(1);
        }
        ExecutionResult::success()
    });
    let orchestrator = orchestrator(host.clone(), dir.path());
    let app = AppBundleInformation::from_app_path(app_bundle(dir.path(), "MyApp"), "com.example.app");

    let code = orchestrator
        .run(&app, &TestTarget::simulator(OsFamily::IOS), None, &RunOptions::default())
        .await;
    assert_eq!(code, ExitCode::PackageInstallationFailure);
    assert!(!host.calls().iter().any(is_sim_launch));
}

#[tokio::test]
async fn test_missing_bundle_never_touches_devices() {
    let dir = tempfile::tempdir().unwrap();
    let host = ScriptedHost::sync(|_, _| ExecutionResult::success());
    let orchestrator = orchestrator(host.clone(), dir.path());
    let app = AppBundleInformation::from_app_path(dir.path().join("Gone.app"), "com.example.gone");

    let run = orchestrator
        .test(&app, &TestTarget::simulator(OsFamily::IOS), None, &TestOptions::default())
        .await;
    assert_eq!(run.exit_code, ExitCode::PackageNotFound);
    assert!(run.outcome.is_none());
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_desktop_run_opens_the_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let host = ScriptedHost::sync(|_, _| ExecutionResult::success());
    let orchestrator = orchestrator(host.clone(), dir.path());
    let app = AppBundleInformation::from_app_path(app_bundle(dir.path(), "Desk"), "com.example.desk");

    let options = RunOptions {
        timeout: Duration::from_secs(30),
        extra_env: vec![("MODE".to_string(), "ci".to_string())],
        extra_args: vec!["--fast".to_string()],
        ..RunOptions::default()
    };
    let code = orchestrator.run(&app, &TestTarget::mac_catalyst(), None, &options).await;
    assert_eq!(code, ExitCode::Success);

    let open = host
        .calls()
        .into_iter()
        .find(|c| c.name() == "open")
        .expect("open was run");
    assert_eq!(&open.args[..2], ["-n", "-W"]);
    assert!(open.args.windows(2).any(|w| w[0] == "--env" && w[1] == "MODE=ci"));
    assert_eq!(open.args.last().map(String::as_str), Some("--fast"));
    assert_eq!(open.timeout, Some(Duration::from_secs(30)));
}
