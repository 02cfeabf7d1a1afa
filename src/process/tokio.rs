//! [`ProcessManager`] backed by `tokio::process`.

use super::{ExecutionResult, OutputSinks, ProcessCommand, ProcessManager, RunningProcess};
use crate::config::ToolsConfig;
use crate::core::error::{Error, Result};
use crate::logs::Log;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a process gets to exit after SIGTERM before it is killed.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// How long output readers may lag behind process exit. Grandchildren that
/// inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Runs real processes.
#[derive(Debug, Clone)]
pub struct TokioProcessManager {
    xcode_root: PathBuf,
    mlaunch: PathBuf,
}

impl TokioProcessManager {
    pub fn new(xcode_root: impl Into<PathBuf>, mlaunch: impl Into<PathBuf>) -> Self {
        Self {
            xcode_root: xcode_root.into(),
            mlaunch: mlaunch.into(),
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(tools.xcode_root.clone(), tools.mlaunch.clone())
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessManager for TokioProcessManager {
    async fn spawn(
        &self,
        command: ProcessCommand,
        sinks: OutputSinks,
        cancel: CancellationToken,
    ) -> Result<RunningProcess> {
        sinks.main.write_line(command.to_string());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::process(format!("failed to start {}: {}", command.name(), e)))?;
        let pid = child.id();
        tracing::debug!(program = %command.name(), pid = ?pid, "process started");

        let readers = [
            child.stdout.take().map(|s| tokio::spawn(pump(s, sinks.stdout.clone()))),
            child.stderr.take().map(|s| tokio::spawn(pump(s, sinks.stderr.clone()))),
        ];

        let supervisor = tokio::spawn(supervise(
            child,
            command.name(),
            command.timeout,
            cancel,
            readers,
            sinks.main,
        ));

        let completion = async move {
            supervisor
                .await
                .map_err(|e| Error::process(format!("process supervisor failed: {}", e)))?
        }
        .boxed();

        Ok(RunningProcess { pid, completion })
    }

    async fn kill_tree(&self, pid: u32, log: &Log) -> Result<()> {
        let output = Command::new("ps")
            .args(["-A", "-o", "ppid=", "-o", "pid="])
            .output()
            .await
            .map_err(|e| Error::process(format!("failed to list processes: {}", e)))?;
        let table = String::from_utf8_lossy(&output.stdout);
        let mut victims = descendants(pid, parse_process_table(&table));
        victims.push(pid);

        for victim in victims {
            log.write_line(format!("Killing process {} (tree of {})", victim, pid));
            send_signal(victim, Signal::Kill);
        }
        Ok(())
    }

    fn xcode_root(&self) -> &Path {
        &self.xcode_root
    }

    fn mlaunch_path(&self) -> &Path {
        &self.mlaunch
    }
}

async fn supervise(
    mut child: Child,
    name: String,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    readers: [Option<JoinHandle<()>>; 2],
    main: Log,
) -> Result<ExecutionResult> {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => futures::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status?),
        _ = deadline => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    let (status, timed_out) = match outcome {
        Outcome::Exited(status) => (status, false),
        Outcome::TimedOut => {
            let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
            main.write_line(format!("Process {} timed out after {} seconds", name, secs));
            (terminate(&mut child).await?, true)
        }
        Outcome::Cancelled => {
            main.write_line(format!("Process {} was cancelled", name));
            (terminate(&mut child).await?, false)
        }
    };

    for reader in readers.into_iter().flatten() {
        let abort = reader.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_LIMIT, reader).await.is_err() {
            abort.abort();
        }
    }

    let exit_code = exit_code(&status);
    main.write_line(format!("Process {} exited with {}", name, exit_code));
    Ok(ExecutionResult::new(exit_code, timed_out))
}

/// SIGTERM, then SIGKILL if the process outlives the grace period.
async fn terminate(child: &mut Child) -> Result<ExitStatus> {
    if let Some(pid) = child.id() {
        send_signal(pid, Signal::Term);
    }
    match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(stream: R, log: Log) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => log.write(&buf),
        }
    }
    log.flush();
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {}

/// `(ppid, pid)` rows from `ps -o ppid= -o pid=`.
fn parse_process_table(table: &str) -> Vec<(u32, u32)> {
    table
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let ppid = parts.next()?.parse().ok()?;
            let pid = parts.next()?.parse().ok()?;
            Some((ppid, pid))
        })
        .collect()
}

/// All descendants of `root`, deepest first.
fn descendants(root: u32, table: Vec<(u32, u32)>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (ppid, pid) in table {
        children.entry(ppid).or_default().push(pid);
    }

    let mut order = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !order.contains(&kid) {
                    order.push(kid);
                    stack.push(kid);
                }
            }
        }
    }
    order.reverse();
    order
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn manager() -> TokioProcessManager {
        TokioProcessManager::new("/Applications/Xcode.app", "mlaunch")
    }

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_execute_captures_output_and_exit_code() {
        let log = Log::memory();
        let result = manager()
            .execute(sh("echo hello; echo oops >&2; exit 3"), OutputSinks::single(&log), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, ExecutionResult::new(3, false));
        let lines = log.lines().unwrap();
        assert!(lines.iter().any(|l| l == "hello"));
        assert!(lines.iter().any(|l| l == "oops"));
    }

    #[tokio::test]
    async fn test_execute_separates_streams() {
        let main = Log::memory();
        let out = Log::memory();
        let err = Log::memory();
        manager()
            .execute(
                sh("echo to-out; echo to-err >&2"),
                OutputSinks::new(main.clone(), out.clone(), err.clone()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out.lines().unwrap(), vec!["to-out"]);
        assert_eq!(err.lines().unwrap(), vec!["to-err"]);
        assert!(main.lines().unwrap()[0].starts_with("/bin/sh -c"));
    }

    #[tokio::test]
    async fn test_execute_timeout_sets_flag() {
        let log = Log::memory();
        let result = manager()
            .execute(
                sh("sleep 30").timeout(Duration::from_millis(200)),
                OutputSinks::single(&log),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.timed_out);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_execute_cancellation_is_not_timeout() {
        let log = Log::memory();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = manager()
            .execute(sh("sleep 30"), OutputSinks::single(&log), cancel)
            .await
            .unwrap();

        assert!(!result.timed_out);
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_is_error() {
        let log = Log::memory();
        let result = manager()
            .spawn(
                ProcessCommand::new("/nonexistent/tool"),
                OutputSinks::single(&log),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_descendants_deepest_first() {
        let table = parse_process_table("  1  10\n 10  11\n 11  12\n 10  13\n  1  20\n");
        let order = descendants(10, table);
        assert_eq!(order.len(), 3);
        assert!(order.contains(&11) && order.contains(&12) && order.contains(&13));
        let pos = |p| order.iter().position(|&x| x == p).unwrap();
        assert!(pos(12) < pos(11));
    }
}
