//! Command-line front end: install, run and test app bundles on Apple
//! devices, simulators and Mac Catalyst.

use clap::{Args, Parser, Subcommand};
use device_test_runner::bundle::AppBundleInformation;
use device_test_runner::config::{ConfigLoader, ListenerTransport, XmlResultJargon};
use device_test_runner::harness::print_report;
use device_test_runner::runner::{RunOptions, TestOptions};
use device_test_runner::target::TestTarget;
use device_test_runner::{Error, ExitCode, Orchestrator, OrchestratorBuilder, logging};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "device-test-runner")]
#[command(about = "Install, run and test app bundles on Apple devices and simulators")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Standalone TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory run logs are written into
    #[arg(short, long, global = true)]
    output_directory: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Install an app bundle
    Install {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Remove an installed app
    Uninstall {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Install, launch and uninstall an app
    Run {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Install a test app, run its tests and collect the results
    Test {
        #[command(flatten)]
        app: AppArgs,
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        test: TestArgs,
    },
    /// List connected devices or available simulators
    List {
        /// List simulators instead of devices
        #[arg(long)]
        simulators: bool,
    },
}

#[derive(Args)]
struct AppArgs {
    /// Path to the .app bundle
    #[arg(short, long)]
    app: Option<PathBuf>,

    /// Bundle identifier; defaults to the bundle's file stem
    #[arg(long)]
    bundle_id: Option<String>,
}

impl AppArgs {
    fn bundle(&self) -> Result<AppBundleInformation, Error> {
        match (&self.app, &self.bundle_id) {
            (Some(path), id) => {
                let id = id.clone().unwrap_or_else(|| {
                    path.file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
                Ok(AppBundleInformation::from_app_path(path, id))
            }
            (None, Some(id)) => Ok(AppBundleInformation::from_bundle_id(id)),
            (None, None) => Err(Error::config("either --app or --bundle-id is required")),
        }
    }
}

#[derive(Args)]
struct TargetArgs {
    /// Run target, e.g. ios-simulator-64, tvos-device or ios-simulator-64_17.2
    #[arg(short, long, value_parser = parse_target)]
    target: TestTarget,

    /// Name or identifier of the device or simulator to use
    #[arg(short, long)]
    device: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Overall run timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Have the app print a tag on exit and stop waiting when it shows up
    #[arg(long)]
    signal_app_end: bool,

    /// Return as soon as the app launched
    #[arg(long)]
    no_wait: bool,

    /// Extra environment variable for the app, NAME=VALUE
    #[arg(long = "set-env", value_parser = parse_env)]
    set_env: Vec<(String, String)>,

    /// Arguments passed to the app
    #[arg(last = true)]
    app_args: Vec<String>,
}

impl RunArgs {
    fn apply(self, options: &mut RunOptions) {
        if let Some(secs) = self.timeout {
            options.timeout = Duration::from_secs(secs);
        }
        options.signal_app_end |= self.signal_app_end;
        if self.no_wait {
            options.wait_for_exit = false;
        }
        options.extra_env = self.set_env;
        options.extra_args = self.app_args;
    }
}

#[derive(Args)]
struct TestArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Seconds the test payload has to connect
    #[arg(long)]
    launch_timeout: Option<u64>,

    /// Result transport: tcp or file
    #[arg(long, value_parser = parse_transport)]
    transport: Option<ListenerTransport>,

    /// Result document flavor, e.g. xunit or nunitv3
    #[arg(long, value_parser = parse_jargon)]
    xml_jargon: Option<XmlResultJargon>,

    /// Reach the device through a TCP tunnel
    #[arg(long)]
    use_tunnel: bool,

    /// Test method to skip (repeatable)
    #[arg(long = "skip-method")]
    skipped_methods: Vec<String>,

    /// Test class to skip (repeatable)
    #[arg(long = "skip-class")]
    skipped_classes: Vec<String>,

    /// Directory of build logs attached to NUnit v3 results
    #[arg(long)]
    additional_logs: Option<PathBuf>,
}

impl TestArgs {
    fn apply(self, options: &mut TestOptions) {
        self.run.apply(&mut options.run);
        if let Some(secs) = self.launch_timeout {
            options.launch_timeout = Duration::from_secs(secs);
        }
        if let Some(transport) = self.transport {
            options.transport = transport;
        }
        if let Some(jargon) = self.xml_jargon {
            options.jargon = jargon;
        }
        options.use_tunnel |= self.use_tunnel;
        options.skipped_methods = self.skipped_methods;
        options.skipped_classes = self.skipped_classes;
        options.additional_logs = self.additional_logs;
    }
}

fn parse_target(s: &str) -> Result<TestTarget, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_transport(s: &str) -> Result<ListenerTransport, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_jargon(s: &str) -> Result<XmlResultJargon, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn build(cli: &Cli, cancel: CancellationToken) -> Result<Orchestrator, Error> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().config_file(path),
        None => ConfigLoader::new().base_dir(std::env::current_dir()?),
    };
    let config = loader.load()?;
    logging::init(cli.verbose || config.verbose);

    for (name, value) in device_test_runner::config::env::detect_active_overrides() {
        tracing::debug!(name = %name, value = %value, "environment override active");
    }

    let mut builder = OrchestratorBuilder::new().with_config(config).cancel_token(cancel);
    if let Some(dir) = &cli.output_directory {
        builder = builder.logs_directory(dir);
    }
    builder.build()
}

async fn execute(orchestrator: &Orchestrator, command: Command) -> Result<ExitCode, Error> {
    let config = &orchestrator.context().config;
    let code = match command {
        Command::Install { app, target } => {
            orchestrator
                .install(&app.bundle()?, &target.target, target.device.as_deref())
                .await
        }
        Command::Uninstall { app, target } => {
            orchestrator
                .uninstall(&app.bundle()?, &target.target, target.device.as_deref())
                .await
        }
        Command::Run { app, target, run } => {
            let mut options = RunOptions::from_config(config);
            run.apply(&mut options);
            orchestrator
                .run(&app.bundle()?, &target.target, target.device.as_deref(), &options)
                .await
        }
        Command::Test { app, target, test } => {
            let mut options = TestOptions::from_config(config);
            test.apply(&mut options);
            let run = orchestrator
                .test(&app.bundle()?, &target.target, target.device.as_deref(), &options)
                .await;
            if let Some(outcome) = &run.outcome {
                print_report(outcome, &orchestrator.context().logs);
            }
            run.exit_code
        }
        Command::List { simulators: true } => {
            for sim in orchestrator.list_simulators().await? {
                println!("{}\t{}\t{:?}\t{}", sim.udid, sim.name, sim.state, sim.os_version());
            }
            ExitCode::Success
        }
        Command::List { simulators: false } => {
            for device in orchestrator.list_devices().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    device.device_identifier,
                    device.name,
                    device.device_class,
                    device.os_version()
                );
            }
            ExitCode::Success
        }
    };
    Ok(code)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let orchestrator = match build(&cli, cancel.clone()) {
        Ok(o) => o,
        Err(e) => {
            logging::init(cli.verbose);
            tracing::error!("{}", e);
            return std::process::ExitCode::from(ExitCode::GeneralFailure.code() as u8);
        }
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping");
            interrupt.cancel();
        }
    });

    let code = match execute(&orchestrator, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::GeneralFailure
        }
    };

    tracing::info!(exit_code = code.code(), "finished with {}", code);
    std::process::ExitCode::from(code.code() as u8)
}
