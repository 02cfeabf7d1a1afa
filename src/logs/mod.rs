//! Run artifacts: the per-run log directory and line-observable logs.
//!
//! A [`Log`] is an append-only text sink backed by a file (or memory). Every
//! complete line written to it is offered to the registered observers, which
//! is how launch and app-end sentinels are detected without polling files.

use crate::core::error::{Error, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub mod capture;

/// What a registered run artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    /// Orchestrator and launcher output.
    Execution,
    /// The app's own console output.
    Application,
    /// Raw test listener output.
    Test,
    /// A final result document.
    XmlResult,
    /// Device, simulator or host system log.
    System,
    /// Crash report, raw or symbolicated.
    Crash,
    /// Externally produced log attached to the run.
    Build,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogKind::Execution => "Execution Log",
            LogKind::Application => "Application Log",
            LogKind::Test => "Test Log",
            LogKind::XmlResult => "XML Test Result",
            LogKind::System => "System Log",
            LogKind::Crash => "Crash Report",
            LogKind::Build => "Build Log",
        };
        f.write_str(name)
    }
}

/// A file registered as part of the run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub path: PathBuf,
    pub kind: LogKind,
}

/// The run's log directory plus a registry of every artifact produced.
#[derive(Debug)]
pub struct Logs {
    directory: PathBuf,
    entries: Mutex<Vec<LogEntry>>,
}

impl Logs {
    /// Open (and create if needed) a log directory.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        crate::util::fs::ensure_dir_exists(&directory)?;
        Ok(Self {
            directory,
            entries: Mutex::new(Vec::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create a new file-backed log in the directory and register it.
    ///
    /// With `timestamp`, the current local time is inserted before the
    /// extension so repeated runs never overwrite each other.
    pub fn create(&self, file_name: &str, kind: LogKind, timestamp: bool) -> Result<Log> {
        let path = self.create_file(file_name, kind, timestamp);
        Log::to_file(path)
    }

    /// Like [`create`](Self::create), mirroring every line to `tracing` at debug level.
    pub fn create_main(&self, file_name: &str) -> Result<Log> {
        let path = self.create_file(file_name, LogKind::Execution, false);
        let log = Log::to_file(path)?;
        log.inner.lock().mirror = true;
        Ok(log)
    }

    /// Reserve and register a path in the log directory without opening it.
    pub fn create_file(&self, file_name: &str, kind: LogKind, timestamp: bool) -> PathBuf {
        let file_name = if timestamp {
            timestamped_name(file_name)
        } else {
            file_name.to_string()
        };
        let path = self.directory.join(file_name);
        self.add_file(&path, kind);
        path
    }

    /// Register a file produced elsewhere.
    pub fn add_file(&self, path: impl Into<PathBuf>, kind: LogKind) {
        let path = path.into();
        let mut entries = lock(&self.entries);
        if !entries.iter().any(|e| e.path == path) {
            entries.push(LogEntry { path, kind });
        }
    }

    /// Snapshot of every registered artifact, in registration order.
    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).clone()
    }

    /// Registered artifacts of one kind.
    pub fn entries_of(&self, kind: LogKind) -> Vec<PathBuf> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.path.clone())
            .collect()
    }
}

fn timestamped_name(file_name: &str) -> String {
    let stamp = crate::core::context::timestamp();
    let path = Path::new(file_name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => format!(
            "{}-{}.{}",
            stem.to_string_lossy(),
            stamp,
            ext.to_string_lossy()
        ),
        _ => format!("{}-{}", file_name, stamp),
    }
}

type OnceAction = Box<dyn FnOnce() + Send>;
type LineAction = Arc<dyn Fn(&str) + Send + Sync>;

enum Observer {
    Once { needle: String, action: OnceAction },
    Every(LineAction),
}

struct LogState {
    file: Option<File>,
    /// Lines of a memory-backed log.
    lines: Vec<String>,
    partial: String,
    observers: Vec<(u64, Observer)>,
    next_id: u64,
    mirror: bool,
}

struct LogInner {
    path: Option<PathBuf>,
    state: Mutex<LogState>,
}

impl LogInner {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        lock(&self.state)
    }
}

/// Append-only, line-observable text log.
///
/// Cloning is cheap and every clone writes to the same sink.
#[derive(Clone)]
pub struct Log {
    inner: Arc<LogInner>,
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log").field("path", &self.inner.path).finish()
    }
}

impl Log {
    /// Open `path` for appending, creating it and its parent if needed.
    pub fn to_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            crate::util::fs::ensure_dir_exists(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self::with_state(Some(path), Some(file)))
    }

    /// A log kept entirely in memory.
    pub fn memory() -> Self {
        Self::with_state(None, None)
    }

    fn with_state(path: Option<PathBuf>, file: Option<File>) -> Self {
        Self {
            inner: Arc::new(LogInner {
                path,
                state: Mutex::new(LogState {
                    file,
                    lines: Vec::new(),
                    partial: String::new(),
                    observers: Vec::new(),
                    next_id: 0,
                    mirror: false,
                }),
            }),
        }
    }

    /// On-disk location, `None` for memory logs.
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Append raw output. Complete lines are dispatched to observers.
    pub fn write(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let mut fired: Vec<OnceAction> = Vec::new();
        let mut every: Vec<LineAction> = Vec::new();
        let mut complete: Vec<String> = Vec::new();

        {
            let mut state = self.inner.lock();
            if let Some(file) = state.file.as_mut() {
                if let Err(e) = file.write_all(text.as_bytes()) {
                    tracing::warn!(path = ?self.inner.path, error = %e, "failed to append to log");
                }
            }

            state.partial.push_str(&text);
            while let Some(pos) = state.partial.find('\n') {
                let mut line: String = state.partial.drain(..=pos).collect();
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
                complete.push(line);
            }

            for line in &complete {
                if state.mirror {
                    tracing::debug!("{}", line);
                }
                if state.file.is_none() {
                    state.lines.push(line.clone());
                }

                let mut i = 0;
                while i < state.observers.len() {
                    let matched = match &state.observers[i].1 {
                        Observer::Once { needle, .. } => line.contains(needle.as_str()),
                        Observer::Every(_) => false,
                    };
                    if matched {
                        if let (_, Observer::Once { action, .. }) = state.observers.remove(i) {
                            fired.push(action);
                        }
                    } else {
                        i += 1;
                    }
                }
            }

            if !complete.is_empty() {
                every = state
                    .observers
                    .iter()
                    .filter_map(|(_, o)| match o {
                        Observer::Every(f) => Some(f.clone()),
                        Observer::Once { .. } => None,
                    })
                    .collect();
            }
        }

        // Observers run outside the lock so they may write to logs themselves.
        for action in fired {
            action();
        }
        for line in &complete {
            for f in &every {
                f(line);
            }
        }
    }

    /// Append one line.
    pub fn write_line(&self, line: impl AsRef<str>) {
        let mut data = line.as_ref().to_string();
        data.push('\n');
        self.write(data.as_bytes());
    }

    /// Terminate a trailing partial line so observers see it.
    pub fn flush(&self) {
        let pending = !self.inner.lock().partial.is_empty();
        if pending {
            self.write(b"\n");
        }
    }

    /// Invoke `action` exactly once, the first time a line containing
    /// `needle` is written. Later matches are ignored.
    ///
    /// Observation stops when the returned guard is dropped.
    #[must_use = "dropping the subscription stops observing the log"]
    pub fn scan_once(&self, needle: impl Into<String>, action: impl FnOnce() + Send + 'static) -> Subscription {
        self.subscribe(Observer::Once {
            needle: needle.into(),
            action: Box::new(action),
        })
    }

    /// Invoke `action` for every complete line written from now on.
    #[must_use = "dropping the subscription stops observing the log"]
    pub fn on_line(&self, action: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.subscribe(Observer::Every(Arc::new(action)))
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.observers.push((id, observer));
        Subscription {
            log: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of observers still attached.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Every complete line written so far.
    pub fn lines(&self) -> Result<Vec<String>> {
        Ok(self.contents()?.lines().map(str::to_string).collect())
    }

    /// Full text written so far.
    pub fn contents(&self) -> Result<String> {
        match &self.inner.path {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                Error::process(format!("failed to read log {}: {}", path.display(), e))
            }),
            None => {
                let state = self.inner.lock();
                let mut text = state.lines.join("\n");
                if !state.lines.is_empty() {
                    text.push('\n');
                }
                text.push_str(&state.partial);
                Ok(text)
            }
        }
    }
}

/// Keeps an observer attached to a [`Log`]; detaches it on drop.
pub struct Subscription {
    log: Weak<LogInner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.log.upgrade() {
            inner.lock().observers.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scan_once_fires_exactly_once() {
        let log = Log::memory();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = log.scan_once("END-TAG", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        log.write_line("starting");
        log.write_line("END-TAG");
        log.write_line("again END-TAG");
        log.write_line("END-TAG one more time");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(log.observer_count(), 0);
    }

    #[test]
    fn test_scan_once_matches_across_partial_writes() {
        let log = Log::memory();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = log.scan_once("launched with pid", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        log.write(b"app was launc");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        log.write(b"hed with pid 42\nnext");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_detaches() {
        let log = Log::memory();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = log.scan_once("x", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(log.observer_count(), 1);
        drop(sub);
        assert_eq!(log.observer_count(), 0);
        log.write_line("x");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_on_line_sees_every_line() {
        let log = Log::memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = log.on_line(move |line| sink.lock().unwrap().push(line.to_string()));

        log.write(b"one\r\ntwo\nthree");
        log.flush();

        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_observer_may_write_to_same_log() {
        let log = Log::memory();
        let echo = log.clone();
        let _sub = log.scan_once("ping", move || echo.write_line("pong"));
        log.write_line("ping");
        assert_eq!(log.lines().unwrap(), vec!["ping", "pong"]);
    }

    #[test]
    fn test_file_log_contents() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::to_file(dir.path().join("nested").join("run.log")).unwrap();
        log.write_line("hello");
        log.write_line("world");
        assert_eq!(log.contents().unwrap(), "hello\nworld\n");
        assert!(log.path().unwrap().exists());
    }

    #[test]
    fn test_logs_registry() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::new(dir.path().join("out")).unwrap();

        let main = logs.create_main("main.log").unwrap();
        main.write_line("hi");
        let test_log = logs.create("test.log", LogKind::Test, true).unwrap();
        logs.add_file("/tmp/crash.ips", LogKind::Crash);
        logs.add_file("/tmp/crash.ips", LogKind::Crash);

        let entries = logs.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, logs.directory().join("main.log"));
        assert_eq!(entries[0].kind, LogKind::Execution);

        let name = test_log.path().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("test-"));
        assert!(name.ends_with(".log"));
        assert_eq!(logs.entries_of(LogKind::Crash), vec![PathBuf::from("/tmp/crash.ips")]);
    }

    #[test]
    fn test_log_kind_display() {
        assert_eq!(LogKind::Crash.to_string(), "Crash Report");
        assert_eq!(LogKind::System.to_string(), "System Log");
    }
}
