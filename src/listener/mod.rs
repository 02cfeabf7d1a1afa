//! Test result listeners.
//!
//! The test payload reports results either over TCP (it connects to the host,
//! or the host connects to it through a tunnel) or by writing a file the host
//! watches. Either way every received byte lands in the run's test log.

pub mod tunnel;

pub use self::tunnel::TunnelBore;

use crate::config::ListenerTransport;
use crate::core::error::{Error, Result};
use crate::logs::Log;
use crate::target::RunMode;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Connections delivering fewer bytes than this only check reachability.
const PING_THRESHOLD: usize = 16;

const BUFFER_SIZE: usize = 16 * 1024;

const TUNNEL_RETRY: Duration = Duration::from_millis(100);
const TUNNEL_RETRY_SLOW: Duration = Duration::from_millis(250);
const TUNNEL_SLOWDOWN_AFTER: Duration = Duration::from_secs(20);
const TUNNEL_GIVE_UP_AFTER: Duration = Duration::from_secs(120);

const FILE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Closing markers of complete result documents written by the payload.
const RESULT_TERMINATORS: &[&str] = &[
    "</assemblies>",
    "</test-run>",
    "</test-results>",
    "</TouchUnitTestRun>",
    "</TestRun>",
    "Tests run:",
];

#[derive(Debug)]
struct Signals {
    connected: watch::Sender<Option<bool>>,
    completed: watch::Sender<Option<bool>>,
}

impl Signals {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: watch::channel(None).0,
            completed: watch::channel(None).0,
        })
    }

    fn connected(&self) {
        self.connected.send_if_modified(|v| settle(v, true));
    }

    /// The listener is done. `received` tells whether a real run came in.
    fn finished(&self, received: bool) {
        self.connected.send_if_modified(|v| settle(v, false));
        self.completed.send_if_modified(|v| settle(v, received));
    }
}

fn settle(slot: &mut Option<bool>, value: bool) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Cloneable view of a listener's progress.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    connected: watch::Receiver<Option<bool>>,
    completed: watch::Receiver<Option<bool>>,
    cancel: CancellationToken,
}

impl ListenerHandle {
    fn new(signals: &Signals, cancel: &CancellationToken) -> Self {
        Self {
            connected: signals.connected.subscribe(),
            completed: signals.completed.subscribe(),
            cancel: cancel.clone(),
        }
    }

    /// `true` once the payload connected, `false` if the listener stopped first.
    pub async fn connected(&self) -> bool {
        let mut rx = self.connected.clone();
        rx.wait_for(Option::is_some)
            .await
            .map(|v| *v == Some(true))
            .unwrap_or(false)
    }

    /// Resolves when the listener is done; `true` if a test run was received.
    pub async fn completed(&self) -> bool {
        let mut rx = self.completed.clone();
        rx.wait_for(Option::is_some)
            .await
            .map(|v| *v == Some(true))
            .unwrap_or(false)
    }

    /// Whether the payload has connected so far.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow() == Some(true)
    }

    /// Whether the listener has stopped or completed.
    pub fn is_finished(&self) -> bool {
        self.completed.borrow().is_some()
    }

    /// Stop listening.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Receives test results from the payload.
#[async_trait]
pub trait TestListener: Send {
    /// Reserve the endpoint and return the port the payload should use
    /// (0 for transports without a port).
    async fn initialize(&mut self) -> Result<u16>;

    /// Begin receiving in the background.
    fn start(&mut self) -> Result<()>;

    fn handle(&self) -> ListenerHandle;

    /// The run's test log, where received data is written.
    fn test_log(&self) -> &Log;

    /// Stop receiving and wait for the background task.
    async fn stop(&mut self);

    /// Called once the tunnel to the device is (or failed to be) open.
    fn tunnel_opened(&self, _opened: bool) {}
}

/// TCP listener, or in tunnel mode a TCP client dialling `localhost:<port>`.
pub struct TcpTestListener {
    log: Log,
    test_log: Log,
    auto_exit: bool,
    use_tunnel: bool,
    port: u16,
    listener: Option<TcpListener>,
    signals: Arc<Signals>,
    tunnel: watch::Sender<Option<bool>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TcpTestListener {
    pub fn new(log: Log, test_log: Log, auto_exit: bool, use_tunnel: bool, parent: &CancellationToken) -> Self {
        Self {
            log,
            test_log,
            auto_exit,
            use_tunnel,
            port: 0,
            listener: None,
            signals: Signals::new(),
            tunnel: watch::channel(None).0,
            cancel: parent.child_token(),
            task: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[async_trait]
impl TestListener for TcpTestListener {
    async fn initialize(&mut self) -> Result<u16> {
        if self.port != 0 && (self.use_tunnel || self.listener.is_some()) {
            return Ok(self.port);
        }

        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| Error::listener(format!("failed to bind test listener: {}", e)))?;
        self.port = listener.local_addr()?.port();

        // Tunnel mode only needs a free port number; the device end listens.
        if !self.use_tunnel {
            self.listener = Some(listener);
        }
        Ok(self.port)
    }

    fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let session = Session {
            log: self.log.clone(),
            test_log: self.test_log.clone(),
            auto_exit: self.auto_exit,
            signals: self.signals.clone(),
            cancel: self.cancel.clone(),
        };

        let task = if self.use_tunnel {
            if self.port == 0 {
                return Err(Error::listener("initialize the listener before starting it"));
            }
            tokio::spawn(session.dial(self.port, self.tunnel.subscribe()))
        } else {
            let listener = self
                .listener
                .take()
                .ok_or_else(|| Error::listener("initialize the listener before starting it"))?;
            tokio::spawn(session.accept(listener))
        };
        self.task = Some(task);
        Ok(())
    }

    fn handle(&self) -> ListenerHandle {
        ListenerHandle::new(&self.signals, &self.cancel)
    }

    fn test_log(&self) -> &Log {
        &self.test_log
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "listener task failed");
            }
        }
        self.signals.finished(false);
    }

    fn tunnel_opened(&self, opened: bool) {
        self.tunnel.send_replace(Some(opened));
    }
}

impl Drop for TcpTestListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    log: Log,
    test_log: Log,
    auto_exit: bool,
    signals: Arc<Signals>,
    cancel: CancellationToken,
}

impl Session {
    async fn accept(self, listener: TcpListener) {
        let mut received = false;
        let address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());

        loop {
            self.log.write_line(format!("Test log server listening on: {}", address));
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.cancel.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.log.write_line(format!("Failed to accept test connection: {}", e));
                    break;
                }
            };

            self.signals.connected();
            self.log.write_line(format!("Connection from {} saving logs to {}", peer, self.test_log_name()));
            let Some(total) = self.receive(stream).await else { break };
            if total >= PING_THRESHOLD {
                received = true;
                if self.auto_exit {
                    break;
                }
            }
        }

        self.signals.finished(received);
    }

    async fn dial(self, port: u16, mut tunnel: watch::Receiver<Option<bool>>) {
        let opened = tokio::select! {
            v = tunnel.wait_for(Option::is_some) => v.map(|v| *v == Some(true)).unwrap_or(false),
            _ = self.cancel.cancelled() => false,
        };
        if !opened {
            self.log.write_line("Tcp tunnel could not be initialized.");
            self.signals.finished(false);
            return;
        }

        let Some(mut stream) = self.connect_through_tunnel(port).await else {
            self.signals.finished(false);
            return;
        };

        // Let the device know we are ready.
        if let Err(e) = stream.write_all(b"ping").await {
            self.log.write_line(format!("Failed to read TCP data: {}", e));
            self.signals.finished(false);
            return;
        }

        self.signals.connected();
        let received = matches!(self.receive(stream).await, Some(total) if total >= PING_THRESHOLD);
        self.signals.finished(received);
    }

    async fn connect_through_tunnel(&self, port: u16) -> Option<TcpStream> {
        let started = Instant::now();
        let mut period = TUNNEL_RETRY;
        let mut attempts: u32 = 0;

        loop {
            match TcpStream::connect(("localhost", port)).await {
                Ok(stream) => {
                    self.log.write_line(format!("Test log server listening on: localhost:{}", port));
                    return Some(stream);
                }
                Err(_) if started.elapsed() > TUNNEL_GIVE_UP_AFTER => {
                    self.log.write_line(format!(
                        "TCP connection hasn't started in time ({}s). Stopped listening.",
                        TUNNEL_GIVE_UP_AFTER.as_secs()
                    ));
                    return None;
                }
                Err(_) => {
                    if period == TUNNEL_RETRY && started.elapsed() > TUNNEL_SLOWDOWN_AFTER {
                        period = TUNNEL_RETRY_SLOW;
                        self.log.write_line(format!(
                            "TCP tunnel still has not connected. Increasing retry period from {} ms to {} ms",
                            TUNNEL_RETRY.as_millis(),
                            TUNNEL_RETRY_SLOW.as_millis()
                        ));
                    } else {
                        attempts += 1;
                        if attempts % 100 == 0 {
                            self.log.write_line("TCP tunnel still has not connected");
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Copy a connection into the test log. `None` when cancelled.
    async fn receive<R: AsyncRead + Unpin>(&self, mut stream: R) -> Option<usize> {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut total = 0;
        loop {
            let read = tokio::select! {
                read = stream.read(&mut buffer) => read,
                _ = self.cancel.cancelled() => {
                    self.test_log.flush();
                    return None;
                }
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    self.test_log.write(&buffer[..n]);
                    total += n;
                }
                Err(e) => {
                    self.log.write_line(format!("Failed to read TCP data: {}", e));
                    break;
                }
            }
        }
        self.test_log.flush();
        Some(total)
    }

    fn test_log_name(&self) -> String {
        self.test_log
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".into())
    }
}

/// Watches the file the payload writes its results into.
pub struct FileTestListener {
    log: Log,
    test_log: Log,
    path: PathBuf,
    signals: Arc<Signals>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FileTestListener {
    pub fn new(log: Log, test_log: Log, path: impl Into<PathBuf>, parent: &CancellationToken) -> Self {
        Self {
            log,
            test_log,
            path: path.into(),
            signals: Signals::new(),
            cancel: parent.child_token(),
            task: None,
        }
    }

    /// Where the payload is told to write (`NUNIT_LOG_FILE`).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TestListener for FileTestListener {
    async fn initialize(&mut self) -> Result<u16> {
        if let Some(parent) = self.path.parent() {
            crate::util::fs::ensure_dir_exists(parent)?;
        }
        // Leftovers from an earlier run would complete the listener at once.
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(0)
    }

    fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let watcher = FileWatch {
            log: self.log.clone(),
            test_log: self.test_log.clone(),
            path: self.path.clone(),
            signals: self.signals.clone(),
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(watcher.run()));
        Ok(())
    }

    fn handle(&self) -> ListenerHandle {
        ListenerHandle::new(&self.signals, &self.cancel)
    }

    fn test_log(&self) -> &Log {
        &self.test_log
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "file listener task failed");
            }
        }
        self.signals.finished(false);
    }
}

impl Drop for FileTestListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FileWatch {
    log: Log,
    test_log: Log,
    path: PathBuf,
    signals: Arc<Signals>,
    cancel: CancellationToken,
}

impl FileWatch {
    async fn run(self) {
        self.log.write_line(format!("Waiting for test results in {}", self.path.display()));
        let mut offset = 0usize;
        let mut seen = String::new();

        loop {
            if let Ok(data) = tokio::fs::read(&self.path).await {
                self.signals.connected();
                if data.len() > offset {
                    let fresh = &data[offset..];
                    self.test_log.write(fresh);
                    seen.push_str(&String::from_utf8_lossy(fresh));
                    offset = data.len();
                }
                if RESULT_TERMINATORS.iter().any(|t| seen.contains(t)) {
                    self.test_log.flush();
                    self.signals.finished(seen.len() >= PING_THRESHOLD);
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(FILE_POLL_INTERVAL) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        self.test_log.flush();
        self.signals.finished(false);
    }
}

/// Transport for a run: watch simulators cannot reach host sockets reliably,
/// so they always report through a file.
pub fn transport_for(run_mode: RunMode, is_simulator: bool, configured: ListenerTransport) -> ListenerTransport {
    if is_simulator && run_mode == RunMode::WatchOS {
        ListenerTransport::File
    } else {
        configured
    }
}

/// Build the listener for a run. The file path is only used by the file transport.
pub fn create_listener(
    transport: ListenerTransport,
    log: &Log,
    test_log: &Log,
    results_file: &Path,
    use_tunnel: bool,
    cancel: &CancellationToken,
) -> Box<dyn TestListener> {
    match transport {
        ListenerTransport::Tcp => Box::new(TcpTestListener::new(
            log.clone(),
            test_log.clone(),
            true,
            use_tunnel,
            cancel,
        )),
        ListenerTransport::File => Box::new(FileTestListener::new(
            log.clone(),
            test_log.clone(),
            results_file,
            cancel,
        )),
    }
}

/// Listener state driven by hand, for tests of code consuming a [`ListenerHandle`].
#[cfg(test)]
pub(crate) struct ManualListener {
    signals: Arc<Signals>,
    cancel: CancellationToken,
}

#[cfg(test)]
impl ManualListener {
    pub fn new() -> Self {
        Self {
            signals: Signals::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle::new(&self.signals, &self.cancel)
    }

    pub fn connect(&self) {
        self.signals.connected();
    }

    pub fn finish(&self, received: bool) {
        self.signals.finished(received);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS: &str = "<assemblies><assembly total=\"1\" passed=\"1\"/></assemblies>\n";

    #[tokio::test]
    async fn test_tcp_listener_receives_run() {
        let test_log = Log::memory();
        let mut listener = TcpTestListener::new(Log::memory(), test_log.clone(), true, false, &CancellationToken::new());
        let port = listener.initialize().await.unwrap();
        assert_ne!(port, 0);
        listener.start().unwrap();
        let handle = listener.handle();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(RESULTS.as_bytes()).await.unwrap();
        drop(client);

        assert!(handle.connected().await);
        assert!(handle.completed().await);
        assert!(test_log.contents().unwrap().contains("<assemblies>"));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_ping_does_not_complete_listener() {
        let mut listener = TcpTestListener::new(Log::memory(), Log::memory(), true, false, &CancellationToken::new());
        let port = listener.initialize().await.unwrap();
        listener.start().unwrap();
        let handle = listener.handle();

        let mut ping = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        ping.write_all(b"ping").await.unwrap();
        drop(ping);
        assert!(handle.connected().await);

        let still_running = tokio::time::timeout(Duration::from_millis(200), handle.completed()).await;
        assert!(still_running.is_err());

        let mut run = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        run.write_all(RESULTS.as_bytes()).await.unwrap();
        drop(run);
        assert!(handle.completed().await);
    }

    #[tokio::test]
    async fn test_stop_before_connection_reports_not_connected() {
        let mut listener = TcpTestListener::new(Log::memory(), Log::memory(), true, false, &CancellationToken::new());
        listener.initialize().await.unwrap();
        listener.start().unwrap();
        let handle = listener.handle();
        listener.stop().await;
        assert!(!handle.connected().await);
        assert!(!handle.completed().await);
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let mut listener = TcpTestListener::new(Log::memory(), Log::memory(), true, false, &CancellationToken::new());
        assert!(listener.start().is_err());
    }

    #[tokio::test]
    async fn test_tunnel_mode_dials_out_and_pings() {
        let test_log = Log::memory();
        let mut listener = TcpTestListener::new(Log::memory(), test_log.clone(), true, true, &CancellationToken::new());
        let port = listener.initialize().await.unwrap();
        listener.start().unwrap();
        let handle = listener.handle();

        let device = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        listener.tunnel_opened(true);
        let (mut stream, _) = device.accept().await.unwrap();
        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        stream.write_all(RESULTS.as_bytes()).await.unwrap();
        drop(stream);

        assert!(handle.connected().await);
        assert!(handle.completed().await);
        assert!(test_log.contents().unwrap().contains("assembly"));
    }

    #[tokio::test]
    async fn test_failed_tunnel_finishes_listener() {
        let mut listener = TcpTestListener::new(Log::memory(), Log::memory(), true, true, &CancellationToken::new());
        listener.initialize().await.unwrap();
        listener.start().unwrap();
        let handle = listener.handle();
        listener.tunnel_opened(false);
        assert!(!handle.connected().await);
        assert!(!handle.completed().await);
    }

    #[tokio::test]
    async fn test_file_listener_completes_on_result_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.xml");
        let test_log = Log::memory();
        let mut listener = FileTestListener::new(Log::memory(), test_log.clone(), &path, &CancellationToken::new());
        assert_eq!(listener.initialize().await.unwrap(), 0);
        listener.start().unwrap();
        let handle = listener.handle();

        std::fs::write(&path, "<assemblies>\n").unwrap();
        assert!(handle.connected().await);
        std::fs::write(&path, RESULTS).unwrap();
        assert!(handle.completed().await);
        assert!(test_log.contents().unwrap().contains("</assemblies>"));
    }

    #[test]
    fn test_watch_simulators_use_file_transport() {
        assert_eq!(
            transport_for(RunMode::WatchOS, true, ListenerTransport::Tcp),
            ListenerTransport::File
        );
        assert_eq!(
            transport_for(RunMode::WatchOS, false, ListenerTransport::Tcp),
            ListenerTransport::Tcp
        );
        assert_eq!(
            transport_for(RunMode::IOS, true, ListenerTransport::File),
            ListenerTransport::File
        );
    }
}
