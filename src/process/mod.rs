//! External process execution.
//!
//! Every tool this crate drives (mlaunch, simctl, sqlite3, open, log) goes
//! through a [`ProcessManager`], so runs can be scripted in tests.

use crate::core::error::Result;
use crate::logs::Log;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod mlaunch;
pub mod tokio;

#[cfg(test)]
pub(crate) mod fake;

pub use self::mlaunch::{MlaunchArgument, MlaunchArguments};
pub use self::tokio::TokioProcessManager;

/// Outcome of one process launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn new(exit_code: i32, timed_out: bool) -> Self {
        Self {
            exit_code,
            timed_out,
        }
    }

    /// Exit code 0, not timed out.
    pub fn success() -> Self {
        Self::new(0, false)
    }

    pub fn failed(exit_code: i32) -> Self {
        Self::new(exit_code, false)
    }

    /// Mark the result as timed out.
    pub fn with_timeout(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// Exit code 0 and not timed out.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Wall-clock limit; `None` runs until exit or cancellation.
    pub timeout: Option<Duration>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        for (k, v) in vars {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program file name, for log messages.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Where a process's output goes.
#[derive(Debug, Clone)]
pub struct OutputSinks {
    /// Receives the command line and exit summary.
    pub main: Log,
    pub stdout: Log,
    pub stderr: Log,
}

impl OutputSinks {
    pub fn new(main: Log, stdout: Log, stderr: Log) -> Self {
        Self {
            main,
            stdout,
            stderr,
        }
    }

    /// Send everything to one log.
    pub fn single(log: &Log) -> Self {
        Self::new(log.clone(), log.clone(), log.clone())
    }
}

/// A process that has been started and is being supervised.
pub struct RunningProcess {
    /// OS process id, when the platform exposes one.
    pub pid: Option<u32>,
    /// Resolves when the process exits, times out, or is cancelled.
    pub completion: BoxFuture<'static, Result<ExecutionResult>>,
}

impl fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningProcess").field("pid", &self.pid).finish()
    }
}

/// Capability to start and supervise external processes.
///
/// Only [`spawn`](ProcessManager::spawn) and the tool locations are
/// required; everything else is built on top of them.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start `command`, piping output into `sinks`.
    ///
    /// The returned completion honors `command.timeout` and `cancel`. A
    /// cancelled process reports `timed_out = false`.
    async fn spawn(
        &self,
        command: ProcessCommand,
        sinks: OutputSinks,
        cancel: CancellationToken,
    ) -> Result<RunningProcess>;

    /// Kill `pid` and every descendant.
    async fn kill_tree(&self, pid: u32, log: &Log) -> Result<()>;

    /// Xcode installation root (the `.app` directory).
    fn xcode_root(&self) -> &Path;

    /// The mlaunch binary.
    fn mlaunch_path(&self) -> &Path;

    /// Run `command` to completion.
    async fn execute(
        &self,
        command: ProcessCommand,
        sinks: OutputSinks,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let running = self.spawn(command, sinks, cancel).await?;
        running.completion.await
    }

    /// Run an Xcode tool such as `simctl` through `xcrun`.
    async fn execute_xcode_command(
        &self,
        args: Vec<String>,
        log: &Log,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let command = self.xcrun_command(args).timeout(timeout);
        self.execute(command, OutputSinks::single(log), cancel).await
    }

    /// `xcrun` command line bound to this Xcode.
    fn xcrun_command(&self, args: Vec<String>) -> ProcessCommand {
        ProcessCommand::new("/usr/bin/xcrun")
            .args(args)
            .env("DEVELOPER_DIR", self.developer_dir().display().to_string())
    }

    fn developer_dir(&self) -> PathBuf {
        self.xcode_root().join("Contents").join("Developer")
    }

    /// mlaunch command line, prefixed with `--sdkroot`.
    fn mlaunch_command(&self, args: &MlaunchArguments) -> ProcessCommand {
        let mut full = MlaunchArguments::new()
            .with(MlaunchArgument::SdkRoot(self.xcode_root().to_path_buf()));
        full.extend(args.iter().cloned());
        ProcessCommand::new(self.mlaunch_path()).args(full.to_args())
    }

    /// Run mlaunch to completion.
    async fn execute_mlaunch(
        &self,
        args: &MlaunchArguments,
        sinks: OutputSinks,
        timeout: Duration,
        env: &BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let command = self.mlaunch_command(args).envs(env).timeout(timeout);
        self.execute(command, sinks, cancel).await
    }
}
