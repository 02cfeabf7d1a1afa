//! System log capture for the duration of a run.

use super::Log;
use crate::core::error::{Error, Result};
use crate::process::{
    ExecutionResult, MlaunchArgument, MlaunchArguments, OutputSinks, ProcessCommand,
    ProcessManager,
};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Host system log, captured for desktop runs.
pub const DESKTOP_SYSTEM_LOG: &str = "/var/log/system.log";

#[derive(Debug, Default)]
struct CaptureState {
    start: u64,
    started: bool,
    stopped: bool,
}

/// Copies what a growing file gained between [`start_capture`](Self::start_capture)
/// and [`stop_capture`](Self::stop_capture) into a run log.
#[derive(Debug)]
pub struct CaptureLog {
    destination: PathBuf,
    source: PathBuf,
    entire_file: bool,
    state: Mutex<CaptureState>,
}

impl CaptureLog {
    pub fn new(destination: impl Into<PathBuf>, source: impl Into<PathBuf>, entire_file: bool) -> Self {
        Self {
            destination: destination.into(),
            source: source.into(),
            entire_file,
            state: Mutex::new(CaptureState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.destination
    }

    /// Remember the current end of the source file.
    pub fn start_capture(&self) {
        let mut state = self.lock();
        if !self.entire_file {
            state.start = file_len(&self.source);
        }
        state.started = true;
    }

    /// Copy the captured range. Idempotent.
    ///
    /// When nothing new was written, waits once for `wait_if_empty` and
    /// checks again.
    pub async fn stop_capture(&self, wait_if_empty: Option<Duration>) -> Result<()> {
        let start = {
            let state = self.lock();
            if state.stopped {
                return Ok(());
            }
            if !state.started && !self.entire_file {
                return Err(Error::process(format!(
                    "capture of {} stopped before it was started",
                    self.source.display()
                )));
            }
            state.start
        };

        if !self.source.exists() {
            std::fs::write(
                &self.destination,
                format!(
                    "Could not capture the file '{}' because it doesn't exist.",
                    self.source.display()
                ),
            )?;
            self.lock().stopped = true;
            return Ok(());
        }

        let mut end = file_len(&self.source);
        if let Some(wait) = wait_if_empty {
            if end == 0 || (end == start && !self.entire_file) {
                tokio::time::sleep(wait).await;
                end = file_len(&self.source);
            }
        }

        let result = self.copy_range(start, end);
        self.lock().stopped = true;
        result
    }

    fn copy_range(&self, start: u64, end: u64) -> Result<()> {
        if self.entire_file || end < start {
            // The file shrank (rotated); the whole file is better than nothing.
            std::fs::copy(&self.source, &self.destination)?;
            return Ok(());
        }

        let mut reader = File::open(&self.source)?;
        reader.seek(SeekFrom::Start(start))?;
        let mut writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.destination)?;
        let mut limited = reader.take(end - start);
        std::io::copy(&mut limited, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// A background process streaming into a log for as long as the guard lives.
pub struct LogStreamCapture {
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<ExecutionResult>>>,
}

impl LogStreamCapture {
    /// Spawn `command` with all output going to `log`.
    pub async fn start(
        processes: &dyn ProcessManager,
        command: ProcessCommand,
        log: &Log,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let cancel = parent.child_token();
        let running = processes
            .spawn(command, OutputSinks::single(log), cancel.clone())
            .await?;
        Ok(Self {
            cancel,
            task: Some(tokio::spawn(running.completion)),
        })
    }

    /// Stop streaming and wait for the process to go away.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "log stream ended with error"),
                Err(e) => tracing::debug!(error = %e, "log stream task failed"),
            }
        }
    }
}

impl Drop for LogStreamCapture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn log_stream_args(app_name: &str) -> Vec<String> {
    vec![
        "stream".into(),
        "--level=debug".into(),
        "--color=none".into(),
        "--style=compact".into(),
        "--predicate".into(),
        format!("senderImagePath contains '{}'", app_name),
    ]
}

/// `log stream` on the host, filtered to the app's process.
pub fn desktop_log_stream_command(app_name: &str) -> ProcessCommand {
    ProcessCommand::new("/usr/bin/log").args(log_stream_args(app_name))
}

/// `log stream` inside a simulator, filtered to the app's process.
pub fn simulator_log_stream_command(
    processes: &dyn ProcessManager,
    udid: &str,
    app_name: &str,
) -> ProcessCommand {
    let mut args = vec!["simctl".to_string(), "spawn".into(), udid.into(), "log".into()];
    args.extend(log_stream_args(app_name));
    processes.xcrun_command(args)
}

/// Captures a hardware device's system log.
#[async_trait]
pub trait DeviceLogCapturer: Send {
    async fn start_capture(&mut self) -> Result<()>;
    async fn stop_capture(&mut self) -> Result<()>;
}

/// Device log capture through `mlaunch --logdev`.
pub struct MlaunchDeviceLogCapturer {
    processes: Arc<dyn ProcessManager>,
    log: Log,
    device_name: String,
    cancel: CancellationToken,
    stream: Option<LogStreamCapture>,
}

impl MlaunchDeviceLogCapturer {
    pub fn new(
        processes: Arc<dyn ProcessManager>,
        log: Log,
        device_name: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            processes,
            log,
            device_name: device_name.into(),
            cancel: cancel.clone(),
            stream: None,
        }
    }
}

#[async_trait]
impl DeviceLogCapturer for MlaunchDeviceLogCapturer {
    async fn start_capture(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::LogDevice)
            .with(MlaunchArgument::DeviceName(self.device_name.clone()));
        let command = self.processes.mlaunch_command(&args);
        self.stream = Some(
            LogStreamCapture::start(self.processes.as_ref(), command, &self.log, &self.cancel)
                .await?,
        );
        Ok(())
    }

    async fn stop_capture(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.stop().await;
        }
        Ok(())
    }
}
