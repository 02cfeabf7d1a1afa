//! Installing and removing app bundles.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::RunTarget;
use crate::bundle::AppBundleInformation;
use crate::config::TimeoutsConfig;
use crate::core::error::{Error, Result};
use crate::logs::Log;
use crate::process::{ExecutionResult, MlaunchArgument, MlaunchArguments, OutputSinks, ProcessManager};

/// `simctl` exit code when the simulator itself is unusable.
pub const SIMCTL_DEVICE_UNAVAILABLE: i32 = 165;

/// One-shot install and uninstall, without retries.
pub struct AppInstaller {
    processes: Arc<dyn ProcessManager>,
    log: Log,
    install_timeout: Duration,
    uninstall_timeout: Duration,
}

impl AppInstaller {
    pub fn new(processes: Arc<dyn ProcessManager>, log: Log) -> Self {
        Self::with_timeouts(processes, log, &TimeoutsConfig::default())
    }

    pub fn with_timeouts(processes: Arc<dyn ProcessManager>, log: Log, timeouts: &TimeoutsConfig) -> Self {
        Self {
            processes,
            log,
            install_timeout: timeouts.install(),
            uninstall_timeout: timeouts.uninstall(),
        }
    }

    /// Install the bundle at `app.app_path`. Watch apps go through the
    /// companion phone when there is one.
    pub async fn install(
        &self,
        app: &AppBundleInformation,
        target: &RunTarget,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        app.ensure_exists()?;

        let args = match target {
            RunTarget::Simulator { device, .. } => MlaunchArguments::new()
                .with(MlaunchArgument::InstallAppOnSimulator(app.app_path.clone()))
                .with(MlaunchArgument::SimulatorUdid(device.udid.clone())),
            RunTarget::Hardware { device, companion } => {
                let name = companion.as_ref().unwrap_or(device).name.clone();
                MlaunchArguments::new()
                    .with(MlaunchArgument::InstallAppOnDevice(app.app_path.clone()))
                    .with(MlaunchArgument::DeviceName(name))
            }
            RunTarget::Desktop => {
                return Err(Error::unsupported("Mac Catalyst apps are not installed"));
            }
        };

        self.log.write_line(format!(
            "Installing '{}' to '{}'",
            app.app_path.display(),
            target.name()
        ));
        let result = self
            .processes
            .execute_mlaunch(
                &args,
                OutputSinks::single(&self.log),
                self.install_timeout,
                &Default::default(),
                cancel.clone(),
            )
            .await?;
        self.report("install", app, target, &result);
        Ok(result)
    }

    /// Remove `app.bundle_identifier` from the target.
    pub async fn uninstall(
        &self,
        app: &AppBundleInformation,
        target: &RunTarget,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.log.write_line(format!(
            "Uninstalling '{}' from '{}'",
            app.bundle_identifier,
            target.name()
        ));
        let result = match target {
            RunTarget::Simulator { device, .. } => {
                let args = vec![
                    "simctl".to_string(),
                    "uninstall".to_string(),
                    device.udid.clone(),
                    app.bundle_identifier.clone(),
                ];
                self.processes
                    .execute_xcode_command(args, &self.log, self.uninstall_timeout, cancel.clone())
                    .await?
            }
            RunTarget::Hardware { device, companion } => {
                let name = companion.as_ref().unwrap_or(device).name.clone();
                let args = MlaunchArguments::new()
                    .with(MlaunchArgument::UninstallAppFromDevice(app.bundle_identifier.clone()))
                    .with(MlaunchArgument::DeviceName(name));
                self.processes
                    .execute_mlaunch(
                        &args,
                        OutputSinks::single(&self.log),
                        self.uninstall_timeout,
                        &Default::default(),
                        cancel.clone(),
                    )
                    .await?
            }
            RunTarget::Desktop => {
                return Err(Error::unsupported("Mac Catalyst apps are not uninstalled"));
            }
        };
        self.report("uninstall", app, target, &result);
        Ok(result)
    }

    fn report(&self, action: &str, app: &AppBundleInformation, target: &RunTarget, result: &ExecutionResult) {
        if result.succeeded() {
            tracing::info!(app = %app.bundle_identifier, device = target.name(), "{} succeeded", action);
        } else {
            tracing::warn!(
                app = %app.bundle_identifier,
                device = target.name(),
                exit_code = result.exit_code,
                timed_out = result.timed_out,
                "{} failed",
                action
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;
    use crate::device::tests::{hardware, simulator};
    use crate::process::fake::FakeProcessManager;

    fn sim_target() -> RunTarget {
        RunTarget::Simulator {
            device: simulator("UDID-1", "com.apple.CoreSimulator.SimRuntime.iOS-17-0", "iPhone-15"),
            companion: None,
        }
    }

    #[tokio::test]
    async fn test_install_on_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("My.app");
        std::fs::create_dir(&bundle).unwrap();

        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let installer = AppInstaller::new(pm.clone(), Log::memory());
        let app = AppBundleInformation::from_app_path(&bundle, "com.example.my");
        let result = installer
            .install(&app, &sim_target(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.succeeded());

        let calls = pm.calls();
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(15 * 60)));
        let line = &pm.command_lines()[0];
        assert!(line.contains(&format!("--installsim {}", bundle.display())), "{}", line);
        assert!(line.contains("--device=:v2:udid=UDID-1"), "{}", line);
    }

    #[tokio::test]
    async fn test_install_watch_app_through_companion() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Watch.app");
        std::fs::create_dir(&bundle).unwrap();

        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::failed(1)));
        let installer = AppInstaller::new(pm.clone(), Log::memory());
        let target = RunTarget::Hardware {
            device: hardware("Watch", DeviceClass::Watch, "10.0"),
            companion: Some(hardware("Phone", DeviceClass::IPhone, "17.0")),
        };
        let app = AppBundleInformation::from_app_path(&bundle, "com.example.watch");
        let result = installer
            .install(&app, &target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(pm.command_lines()[0].contains("--devname Phone"));
    }

    #[tokio::test]
    async fn test_install_missing_bundle() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let installer = AppInstaller::new(pm.clone(), Log::memory());
        let app = AppBundleInformation::from_app_path("/nonexistent/My.app", "com.example.my");
        let err = installer
            .install(&app, &sim_target(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BundleNotFound(_)));
        assert!(pm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_from_simulator_and_device() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let installer = AppInstaller::new(pm.clone(), Log::memory());
        let app = AppBundleInformation::from_bundle_id("com.example.my");
        let cancel = CancellationToken::new();

        installer.uninstall(&app, &sim_target(), &cancel).await.unwrap();
        let device = RunTarget::Hardware {
            device: hardware("Phone", DeviceClass::IPhone, "17.0"),
            companion: None,
        };
        installer.uninstall(&app, &device, &cancel).await.unwrap();

        let lines = pm.command_lines();
        assert_eq!(lines[0], "xcrun simctl uninstall UDID-1 com.example.my");
        assert!(lines[1].contains("--uninstalldevbundleid com.example.my --devname Phone"));
        assert_eq!(pm.calls()[1].timeout, Some(Duration::from_secs(180)));
    }

    #[tokio::test]
    async fn test_desktop_is_not_installed() {
        let pm = Arc::new(FakeProcessManager::always(ExecutionResult::success()));
        let installer = AppInstaller::new(pm, Log::memory());
        let app = AppBundleInformation::from_bundle_id("com.example.my");
        let err = installer
            .uninstall(&app, &RunTarget::Desktop, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
