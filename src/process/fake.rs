//! Scripted process manager for unit tests.

use super::{ExecutionResult, OutputSinks, ProcessCommand, ProcessManager, RunningProcess};
use crate::core::error::{Error, Result};
use crate::logs::Log;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

type Handler =
    dyn Fn(&ProcessCommand, &OutputSinks, CancellationToken) -> BoxFuture<'static, ExecutionResult>
        + Send
        + Sync;

type SpawnCheck = dyn Fn(&ProcessCommand) -> bool + Send + Sync;

pub(crate) struct FakeProcessManager {
    handler: Box<Handler>,
    unspawnable: Option<Box<SpawnCheck>>,
    calls: Mutex<Vec<ProcessCommand>>,
    killed: Mutex<Vec<u32>>,
    xcode_root: PathBuf,
    mlaunch: PathBuf,
}

impl FakeProcessManager {
    pub fn new(
        handler: impl Fn(&ProcessCommand, &OutputSinks, CancellationToken) -> BoxFuture<'static, ExecutionResult>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            unspawnable: None,
            calls: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            xcode_root: PathBuf::from("/Applications/Xcode.app"),
            mlaunch: PathBuf::from("/usr/local/bin/mlaunch"),
        }
    }

    /// Every command answers with `result` immediately.
    pub fn always(result: ExecutionResult) -> Self {
        Self::new(move |_, _, _| futures::future::ready(result).boxed())
    }

    /// Synchronous handler that may write to the sinks or the filesystem.
    pub fn sync(
        handler: impl Fn(&ProcessCommand, &OutputSinks) -> ExecutionResult + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |cmd, sinks, _| futures::future::ready(handler(cmd, sinks)).boxed())
    }

    /// Commands matching `check` fail to spawn, like a missing executable.
    pub fn failing_spawn(mut self, check: impl Fn(&ProcessCommand) -> bool + Send + Sync + 'static) -> Self {
        self.unspawnable = Some(Box::new(check));
        self
    }

    pub fn calls(&self) -> Vec<ProcessCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines run so far, program name plus arguments.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| format!("{} {}", c.name(), c.args.join(" ")))
            .collect()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

/// Value of a `--flag=value` argument.
pub(crate) fn arg_value<'a>(command: &'a ProcessCommand, flag: &str) -> Option<&'a str> {
    let prefix = format!("{}=", flag);
    command.args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

pub(crate) fn has_arg(command: &ProcessCommand, arg: &str) -> bool {
    command.args.iter().any(|a| a == arg)
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn spawn(
        &self,
        command: ProcessCommand,
        sinks: OutputSinks,
        cancel: CancellationToken,
    ) -> Result<RunningProcess> {
        if self.unspawnable.as_ref().is_some_and(|check| check(&command)) {
            return Err(Error::process(format!("failed to spawn {}", command.name())));
        }
        sinks.main.write_line(command.to_string());
        let completion = (self.handler)(&command, &sinks, cancel);
        self.calls.lock().unwrap().push(command);
        Ok(RunningProcess {
            pid: Some(4242),
            completion: completion.map(Ok).boxed(),
        })
    }

    async fn kill_tree(&self, pid: u32, _log: &Log) -> Result<()> {
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }

    fn xcode_root(&self) -> &Path {
        &self.xcode_root
    }

    fn mlaunch_path(&self) -> &Path {
        &self.mlaunch
    }
}
