//! device-test-runner: installs, launches and supervises app bundles on Apple
//! devices, simulators and Mac Catalyst, and turns the run into a test verdict.
//!
//! The heavy lifting is done by external tools (`mlaunch`, `xcrun simctl`,
//! `log`, `open`); this crate drives them, watches their output, collects
//! logs and crash reports, and listens for the results the test payload
//! sends back.
//!
//! # Quick Start
//!
//! ```no_run
//! use device_test_runner::bundle::AppBundleInformation;
//! use device_test_runner::runner::TestOptions;
//! use device_test_runner::target::{OsFamily, TestTarget};
//!
//! # async fn demo() -> device_test_runner::Result<()> {
//! let orchestrator = device_test_runner::builder()
//!     .from_config_file("device-test-runner.toml")?
//!     .build()?;
//!
//! let app = AppBundleInformation::from_app_path("bin/MyTests.app", "com.example.tests");
//! let run = orchestrator
//!     .test(&app, &TestTarget::simulator(OsFamily::IOS), None, &TestOptions::default())
//!     .await;
//! std::process::exit(run.exit_code.code());
//! # }
//! ```
//!
//! ## Configuration file
//!
//! ```toml
//! [tools]
//! mlaunch = "/usr/local/bin/mlaunch"
//! xcode-root = "/Applications/Xcode_15.app"
//!
//! [timeouts]
//! run = 1200
//! launch = 300
//!
//! [listener]
//! transport = "tcp"
//! xml-jargon = "xunit"
//!
//! [profiles.ci.simulator]
//! reset = true
//! ```
//!
//! Environment variables prefixed with `DEVICE_TEST_RUNNER_` override the file,
//! and `DEVICE_TEST_RUNNER_PROFILE` selects a profile.
//!
//! # Architecture
//!
//! The library is built around a few seams:
//!
//! - [`ProcessManager`](process::ProcessManager): spawns and supervises external tools
//! - [`TestListener`](listener::TestListener): receives results from the test payload
//! - [`CrashStore`](crash::CrashStore): snapshots and collects crash reports
//! - [`DeviceLogCapturer`](logs::capture::DeviceLogCapturer): streams a device's system log
//!
//! [`Orchestrator`] ties them together for one session.

pub mod bundle;
pub mod config;
pub mod core;
pub mod crash;
pub mod device;
pub mod harness;
pub mod listener;
pub mod logging;
pub mod logs;
pub mod process;
pub mod runner;
pub mod target;
pub mod tcc;
pub mod util;
pub mod xml;

// Re-export commonly used types
pub use crate::core::{Context, Error, ExitCode, Orchestrator, OrchestratorBuilder, Result, TestRun};
pub use config::Config;

/// Create a new orchestrator builder.
///
/// This is the main entry point for the library API.
pub fn builder() -> OrchestratorBuilder {
    OrchestratorBuilder::new()
}
