//! A scripted stand-in for the Apple tool chain.

#![allow(dead_code)]

use async_trait::async_trait;
use device_test_runner::Result;
use device_test_runner::logs::Log;
use device_test_runner::process::{ExecutionResult, OutputSinks, ProcessCommand, ProcessManager, RunningProcess};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const IOS_17: &str = "com.apple.CoreSimulator.SimRuntime.iOS-17-0";
pub const IPHONE_X: &str = "com.apple.CoreSimulator.SimDeviceType.iPhone-X";

type Handler = dyn Fn(&ProcessCommand, &OutputSinks, CancellationToken) -> BoxFuture<'static, ExecutionResult> + Send + Sync;

/// Answers every command through a handler and records what was run.
pub struct ScriptedHost {
    handler: Box<Handler>,
    calls: Mutex<Vec<ProcessCommand>>,
    xcode_root: PathBuf,
    mlaunch: PathBuf,
}

impl ScriptedHost {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&ProcessCommand, &OutputSinks, CancellationToken) -> BoxFuture<'static, ExecutionResult> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            xcode_root: PathBuf::from("/Applications/Xcode.app"),
            mlaunch: PathBuf::from("/usr/local/bin/mlaunch"),
        })
    }

    /// Handler without async work.
    pub fn sync<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&ProcessCommand, &OutputSinks) -> ExecutionResult + Send + Sync + 'static,
    {
        Self::new(move |cmd, sinks, _| futures::future::ready(handler(cmd, sinks)).boxed())
    }

    /// `program-name arg arg ...` for every recorded command.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| {
                std::iter::once(c.name())
                    .chain(c.args.iter().cloned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<ProcessCommand> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessManager for ScriptedHost {
    async fn spawn(&self, command: ProcessCommand, sinks: OutputSinks, cancel: CancellationToken) -> Result<RunningProcess> {
        let completion = (self.handler)(&command, &sinks, cancel);
        self.calls.lock().unwrap().push(command);
        Ok(RunningProcess {
            pid: Some(4242),
            completion: completion.map(Ok).boxed(),
        })
    }

    async fn kill_tree(&self, _pid: u32, _log: &Log) -> Result<()> {
        Ok(())
    }

    fn xcode_root(&self) -> &Path {
        &self.xcode_root
    }

    fn mlaunch_path(&self) -> &Path {
        &self.mlaunch
    }
}

/// Value of a `--flag=value` argument.
pub fn arg_value<'a>(cmd: &'a ProcessCommand, flag: &str) -> Option<&'a str> {
    let prefix = format!("{}=", flag);
    cmd.args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

/// Value the launcher passes to the app as `NAME`.
pub fn env_arg(cmd: &ProcessCommand, name: &str) -> Option<String> {
    arg_value(cmd, &format!("-setenv={}", name)).map(str::to_string)
}

pub fn is_simctl(cmd: &ProcessCommand, action: &str) -> bool {
    cmd.args.first().map(String::as_str) == Some("simctl") && cmd.args.get(1).map(String::as_str) == Some(action)
}

/// Simulator listing with one booted iOS 17 phone whose data lives in `root`.
pub fn simulator_listing(root: &Path) -> String {
    let data = root.join("sim-data");
    let logs = root.join("sim-logs");
    format!(
        r#"<MTouch><Simulator>
<SupportedRuntimes><SimRuntime><Name>iOS 17.0</Name><Identifier>{IOS_17}</Identifier><Version>1</Version></SimRuntime></SupportedRuntimes>
<SupportedDeviceTypes><SimDeviceType><Name>iPhone X</Name><Identifier>{IPHONE_X}</Identifier></SimDeviceType></SupportedDeviceTypes>
<AvailableDevices><SimDevice UDID="SIM-1" Name="Test iPhone" State="Booted"><SimRuntime>{IOS_17}</SimRuntime><SimDeviceType>{IPHONE_X}</SimDeviceType><DataPath>{}</DataPath><LogPath>{}</LogPath></SimDevice></AvailableDevices>
<AvailableDevicePairs></AvailableDevicePairs>
</Simulator></MTouch>"#,
        data.display(),
        logs.display()
    )
}

/// Lay out the simulator directories `simulator_listing` points at.
pub fn create_simulator_dirs(root: &Path) {
    let tcc = root.join("sim-data").join("data").join("Library").join("TCC");
    std::fs::create_dir_all(&tcc).unwrap();
    std::fs::write(tcc.join("TCC.db"), b"").unwrap();
    std::fs::create_dir_all(root.join("sim-logs")).unwrap();
    std::fs::write(root.join("sim-logs").join("system.log"), "boot\n").unwrap();
}

/// An app bundle directory under `root`.
pub fn app_bundle(root: &Path, name: &str) -> PathBuf {
    let path = root.join(format!("{}.app", name));
    std::fs::create_dir_all(&path).unwrap();
    path
}
