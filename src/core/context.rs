use crate::config::Config;
use crate::core::error::Result;
use crate::logs::{Log, Logs};
use crate::process::ProcessManager;
use crate::runner::{AppInstaller, RunnerBase};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// File name of the session log every component writes its progress into.
pub const MAIN_LOG: &str = "main.log";

/// Local time stamp inserted into log file names.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// State shared by every operation of one session.
#[derive(Clone)]
pub struct Context {
    /// Configuration.
    pub config: Config,

    /// Registry of every artifact the session produces.
    pub logs: Arc<Logs>,

    /// Session log, mirrored to `tracing`.
    pub main_log: Log,

    /// Process execution backend.
    pub processes: Arc<dyn ProcessManager>,

    /// Cancelling this stops every running operation.
    pub cancel: CancellationToken,

    /// Where local crash reports are looked for; `None` uses the host default.
    pub crash_directory: Option<PathBuf>,
}

impl Context {
    /// Create the log directory and the session log.
    pub fn new(config: Config, processes: Arc<dyn ProcessManager>, cancel: CancellationToken) -> Result<Self> {
        let logs = Arc::new(Logs::new(config.logs.directory.clone())?);
        let main_log = logs.create_main(MAIN_LOG)?;
        Ok(Self {
            config,
            logs,
            main_log,
            processes,
            cancel,
            crash_directory: None,
        })
    }

    /// Launch machinery bound to this session.
    pub fn runner_base(&self) -> RunnerBase {
        let base = RunnerBase::new(
            self.processes.clone(),
            self.logs.clone(),
            self.main_log.clone(),
            &self.cancel,
        );
        match &self.crash_directory {
            Some(dir) => base.with_crash_directory(dir.clone()),
            None => base,
        }
    }

    pub fn installer(&self) -> AppInstaller {
        AppInstaller::with_timeouts(
            self.processes.clone(),
            self.main_log.clone(),
            &self.config.timeouts,
        )
    }
}
