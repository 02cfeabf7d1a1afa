//! Crash report collection by snapshot diffing.
//!
//! The crash store is listed before launch and polled after the run; whatever
//! appeared in between is copied (or downloaded and symbolicated) into the
//! run's logs.

use crate::core::error::{Error, Result};
use crate::logs::{Log, LogKind, Logs};
use crate::process::{
    MlaunchArgument, MlaunchArguments, OutputSinks, ProcessCommand, ProcessManager,
};
use crate::util::fs::{copy_file_with_retry, list_files};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Opaque crash report identifiers at an instant.
pub type CrashSnapshot = BTreeSet<String>;

/// Reports present in `after` but not in `before`.
pub fn new_crashes(before: &CrashSnapshot, after: &CrashSnapshot) -> CrashSnapshot {
    after.difference(before).cloned().collect()
}

/// Somewhere crash reports accumulate.
#[async_trait]
pub trait CrashStore: Send + Sync {
    /// Identifiers of every report currently in the store.
    async fn snapshot(&self) -> Result<CrashSnapshot>;

    /// Bring one report into the run's logs and return where it landed.
    async fn collect(&self, id: &str) -> Result<PathBuf>;
}

/// Crash reports on this machine: desktop apps and simulators.
pub struct LocalCrashStore {
    directory: PathBuf,
    logs: Arc<Logs>,
}

impl LocalCrashStore {
    pub fn new(directory: impl Into<PathBuf>, logs: Arc<Logs>) -> Self {
        Self {
            directory: directory.into(),
            logs,
        }
    }

    /// `$HOME/Library/Logs/DiagnosticReports`.
    pub fn default_directory() -> PathBuf {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join("Library").join("Logs").join("DiagnosticReports")
    }

    pub fn for_host(logs: Arc<Logs>) -> Self {
        Self::new(Self::default_directory(), logs)
    }
}

#[async_trait]
impl CrashStore for LocalCrashStore {
    async fn snapshot(&self) -> Result<CrashSnapshot> {
        Ok(list_files(&self.directory)?
            .into_iter()
            .map(|p| p.display().to_string())
            .collect())
    }

    async fn collect(&self, id: &str) -> Result<PathBuf> {
        let source = Path::new(id);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::crash_reporter(format!("invalid crash report path '{}'", id)))?;
        let destination = self.logs.create_file(&name, LogKind::Crash, false);
        // The crashing process may still be writing the report.
        copy_file_with_retry(source, &destination, 3, Duration::from_secs(2)).await?;
        Ok(destination)
    }
}

const SYMBOLICATE_CANDIDATES: &[&str] = &[
    "Contents/SharedFrameworks/DTDeviceKitBase.framework/Versions/A/Resources/symbolicatecrash",
    "Contents/SharedFrameworks/DVTFoundation.framework/Versions/A/Resources/symbolicatecrash",
];

/// Crash reports on a hardware device, reached through the launcher.
pub struct DeviceCrashStore {
    processes: Arc<dyn ProcessManager>,
    logs: Arc<Logs>,
    log: Log,
    device_name: String,
    cancel: CancellationToken,
}

impl DeviceCrashStore {
    pub fn new(
        processes: Arc<dyn ProcessManager>,
        logs: Arc<Logs>,
        log: Log,
        device_name: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            processes,
            logs,
            log,
            device_name: device_name.into(),
            cancel: cancel.clone(),
        }
    }

    fn symbolicate_tool(&self) -> Option<PathBuf> {
        SYMBOLICATE_CANDIDATES
            .iter()
            .map(|c| self.processes.xcode_root().join(c))
            .find(|p| p.exists())
    }

    async fn symbolicate(&self, report: &Path) -> Option<PathBuf> {
        let Some(tool) = self.symbolicate_tool() else {
            self.log.write_line(format!(
                "Could not find symbolicatecrash in {}, crash report will not be symbolicated",
                self.processes.xcode_root().display()
            ));
            return None;
        };

        let name = report.file_name()?.to_string_lossy().into_owned();
        let target = self
            .logs
            .create_file(&format!("{}.symbolicated.log", name), LogKind::Crash, false);
        let output = Log::to_file(&target).ok()?;
        let command = ProcessCommand::new(tool)
            .arg(report.display().to_string())
            .env("DEVELOPER_DIR", self.processes.developer_dir().display().to_string())
            .timeout(Duration::from_secs(600));
        let sinks = OutputSinks::new(self.log.clone(), output.clone(), self.log.clone());
        let result = self.processes.execute(command, sinks, self.cancel.clone()).await;
        output.flush();
        match result {
            Ok(r) if r.succeeded() => Some(target),
            Ok(r) => {
                self.log.write_line(format!("Failed to symbolicate {}: exit code {}", name, r.exit_code));
                None
            }
            Err(e) => {
                self.log.write_line(format!("Failed to symbolicate {}: {}", name, e));
                None
            }
        }
    }
}

#[async_trait]
impl CrashStore for DeviceCrashStore {
    async fn snapshot(&self) -> Result<CrashSnapshot> {
        let listing = crate::device::TempListing::new("crash-reports");
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::ListCrashReports(listing.0.clone()))
            .with(MlaunchArgument::DeviceName(self.device_name.clone()));
        let result = self
            .processes
            .execute_mlaunch(
                &args,
                OutputSinks::single(&self.log),
                Duration::from_secs(60),
                &Default::default(),
                self.cancel.clone(),
            )
            .await?;
        if !result.succeeded() {
            return Err(Error::crash_reporter(format!(
                "Failed to list crash reports on {}",
                self.device_name
            )));
        }
        let contents = std::fs::read_to_string(&listing.0).unwrap_or_default();
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn collect(&self, id: &str) -> Result<PathBuf> {
        let name = Path::new(id)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.to_string());
        let destination = self.logs.create_file(&name, LogKind::Crash, false);
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::DownloadCrashReport(id.to_string()))
            .with(MlaunchArgument::DownloadCrashReportTo(destination.clone()))
            .with(MlaunchArgument::DeviceName(self.device_name.clone()));
        let result = self
            .processes
            .execute_mlaunch(
                &args,
                OutputSinks::single(&self.log),
                Duration::from_secs(60),
                &Default::default(),
                self.cancel.clone(),
            )
            .await?;
        if !result.succeeded() {
            return Err(Error::crash_reporter(format!("Could not download crash report {}", id)));
        }

        Ok(self.symbolicate(&destination).await.unwrap_or(destination))
    }
}

/// Brackets a run with crash store snapshots.
pub struct CrashSnapshotReporter {
    store: Box<dyn CrashStore>,
    logs: Arc<Logs>,
    log: Log,
    initial: Option<CrashSnapshot>,
    poll_interval: Duration,
}

impl CrashSnapshotReporter {
    pub fn new(store: Box<dyn CrashStore>, logs: Arc<Logs>, log: Log) -> Self {
        Self {
            store,
            logs,
            log,
            initial: None,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Record the reports present before launch.
    pub async fn start_capture(&mut self) -> Result<()> {
        let snapshot = self.store.snapshot().await?;
        tracing::debug!(count = snapshot.len(), "crash snapshot taken");
        self.initial = Some(snapshot);
        Ok(())
    }

    /// Wait up to `timeout` for new reports and collect them.
    ///
    /// Fails with [`Error::CaptureNotStarted`] without a preceding
    /// [`start_capture`](Self::start_capture).
    pub async fn end_capture(&mut self, timeout: Duration) -> Result<Vec<PathBuf>> {
        let initial = self.initial.take().ok_or(Error::CaptureNotStarted)?;

        let deadline = Instant::now() + timeout;
        let found = loop {
            let after = match self.store.snapshot().await {
                Ok(after) => after,
                Err(e) => {
                    self.log.write_line(format!("Failed to list crash reports: {}", e));
                    CrashSnapshot::new()
                }
            };
            let found = new_crashes(&initial, &after);
            if !found.is_empty() || Instant::now() >= deadline {
                break found;
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        if found.is_empty() {
            self.log.write_line("No crash reports were found");
            return Ok(Vec::new());
        }

        self.log.write_line(format!("Found {} new crash report(s)", found.len()));
        let mut collected = Vec::new();
        for id in &found {
            match self.store.collect(id).await {
                Ok(path) => {
                    self.log.write_line(format!("Crash report {} saved to {}", id, path.display()));
                    self.logs.add_file(&path, LogKind::Crash);
                    collected.push(path);
                }
                Err(e) => self
                    .log
                    .write_line(format!("Could not collect crash report {}: {}", id, e)),
            }
        }
        Ok(collected)
    }
}
