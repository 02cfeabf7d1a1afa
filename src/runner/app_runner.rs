//! Plain app runs: launch, wait, collect crashes.

use super::{
    AppEndSignal, AppEnvironment, RUN_END_TAG, RunOptions, RunTarget, RunnerBase, check_bundle,
    push_app_arguments,
};
use crate::bundle::{AppBundleInformation, Extension};
use crate::core::error::{Error, Result};
use crate::device::{DeviceClass, HardwareDevice, SimulatorDevice};
use crate::logs::{Log, LogKind};
use crate::logs::capture::MlaunchDeviceLogCapturer;
use crate::process::{ExecutionResult, MlaunchArgument, MlaunchArguments};

/// Launch argument for a simulator, extension aware.
pub(crate) fn simulator_launch(app: &AppBundleInformation) -> Result<MlaunchArgument> {
    match app.extension {
        None => Ok(MlaunchArgument::LaunchSimulatorBundleId(app.bundle_identifier.clone())),
        Some(Extension::TodayExtension) => Ok(MlaunchArgument::LaunchSimulatorExtension {
            launch_path: app.launch_app_path.display().to_string(),
            bundle_id: app.bundle_identifier.clone(),
        }),
        Some(Extension::WatchKit2) => Err(unlaunchable(app)),
    }
}

/// Launch argument for a hardware device, extension aware.
pub(crate) fn device_launch(app: &AppBundleInformation) -> Result<MlaunchArgument> {
    match app.extension {
        None => Ok(MlaunchArgument::LaunchDeviceBundleId(app.bundle_identifier.clone())),
        Some(Extension::TodayExtension) => Ok(MlaunchArgument::LaunchDeviceExtension {
            launch_path: app.launch_app_path.display().to_string(),
            bundle_id: app.bundle_identifier.clone(),
        }),
        Some(Extension::WatchKit2) => Err(unlaunchable(app)),
    }
}

fn unlaunchable(app: &AppBundleInformation) -> Error {
    Error::unsupported(format!(
        "'{}' is a WatchKit 2 extension and cannot be launched",
        app.bundle_identifier
    ))
}

/// Runs apps without a test listener.
pub struct AppRunner {
    base: RunnerBase,
}

impl AppRunner {
    pub fn new(base: RunnerBase) -> Self {
        Self { base }
    }

    /// Launch `app` on `target` and report how the launcher ended.
    ///
    /// Only a missing bundle, device errors and unlaunchable bundles are
    /// errors. Timeouts and failed exits come back in the result.
    pub async fn run_app(
        &self,
        app: &AppBundleInformation,
        target: &RunTarget,
        options: &RunOptions,
    ) -> Result<ExecutionResult> {
        check_bundle(app)?;
        let base = &self.base;
        let app_log = base.create_app_log(app, target)?;

        let mut crashes = base.crash_reporter(target);
        if let Err(e) = crashes.start_capture().await {
            base.main_log
                .write_line(format!("Failed to start crash capture: {}", e));
        }

        let result = match target {
            RunTarget::Simulator { device, companion } => {
                let env = caller_environment(options, None, &base.main_log);
                let args = simulator_arguments(app, device, &env, options)?;
                base.run_simulator_app(app, device, companion.as_ref(), &args, &app_log, options)
                    .await
            }
            RunTarget::Hardware { device, .. } => {
                let app_end = options
                    .signal_app_end
                    .then(|| AppEndSignal::watch(&app_log, &base.cancel));
                let env = caller_environment(options, app_end.as_ref(), &base.main_log);
                let args = device_arguments(app, device, &env, options)?;
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
                base.run_device_app(app, device, &args, &app_log, &mut capturer, app_end.as_ref(), options)
                    .await
            }
            RunTarget::Desktop => {
                let env = caller_environment(options, None, &base.main_log);
                base.run_desktop_app(app, &env, &app_log, options).await
            }
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                base.end_crash_capture(&mut crashes, &ExecutionResult::failed(1)).await;
                return Err(e);
            }
        };
        base.end_crash_capture(&mut crashes, &result).await;

        base.main_log.write_line(format!(
            "Application '{}' finished with exit code {}{}",
            app.app_name,
            result.exit_code,
            if result.timed_out { " (timed out)" } else { "" }
        ));
        Ok(result)
    }

    /// Launch a Mac Catalyst bundle on the host.
    pub async fn run_desktop_app(&self, app: &AppBundleInformation, options: &RunOptions) -> Result<ExecutionResult> {
        self.run_app(app, &RunTarget::Desktop, options).await
    }
}

fn caller_environment(options: &RunOptions, app_end: Option<&AppEndSignal>, log: &Log) -> AppEnvironment {
    let mut env = AppEnvironment::new();
    if let Some(signal) = app_end {
        env.set(RUN_END_TAG, signal.tag());
    }
    env.add_extra(&options.extra_env, log);
    env
}

/// `env`, app arguments, the simulator and the launch.
pub(crate) fn simulator_arguments(
    app: &AppBundleInformation,
    simulator: &SimulatorDevice,
    env: &AppEnvironment,
    options: &RunOptions,
) -> Result<MlaunchArguments> {
    let mut args: MlaunchArguments = env.to_mlaunch().collect();
    push_app_arguments(&mut args, &options.extra_args);
    args.push(MlaunchArgument::SimulatorUdid(simulator.udid.clone()));
    args.push(simulator_launch(app)?);
    if options.wait_for_exit {
        args.push(MlaunchArgument::WaitForExit);
    }
    Ok(args)
}

/// `env`, app arguments, the device and the launch. Watch apps only exit
/// reliably under the debugger.
pub(crate) fn device_arguments(
    app: &AppBundleInformation,
    device: &HardwareDevice,
    env: &AppEnvironment,
    options: &RunOptions,
) -> Result<MlaunchArguments> {
    let mut args: MlaunchArguments = env.to_mlaunch().collect();
    push_app_arguments(&mut args, &options.extra_args);
    args.push(MlaunchArgument::DisableMemoryLimits);
    args.push(MlaunchArgument::DeviceName(device.name.clone()));
    args.push(device_launch(app)?);
    if device.device_class == DeviceClass::Watch {
        args.push(MlaunchArgument::AttachNativeDebugger);
    } else {
        args.push(MlaunchArgument::WaitForExit);
    }
    Ok(args)
}
