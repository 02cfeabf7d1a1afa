//! TCP tunnels to hardware devices through `mlaunch --tcp-tunnel`.

use crate::core::error::Result;
use crate::logs::Log;
use crate::process::{MlaunchArgument, MlaunchArguments, OutputSinks, ProcessManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TUNNEL_STARTED: &str = "Tcp tunnel started on device";

struct Tunnel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the tunnel processes of a session, one per device.
pub struct TunnelBore {
    processes: Arc<dyn ProcessManager>,
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl TunnelBore {
    pub fn new(processes: Arc<dyn ProcessManager>) -> Self {
        Self {
            processes,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Start a tunnel forwarding `port` on the host to the same port on
    /// `device`, and wait until it reports it is up.
    ///
    /// Returns `false` when the tunnel process exits before that. An already
    /// open tunnel to the device is replaced.
    pub async fn create(
        &self,
        device: &str,
        port: u16,
        log: &Log,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Result<bool> {
        self.close(device).await;

        let (started_tx, started_rx) = oneshot::channel();
        let scan = log.scan_once(TUNNEL_STARTED, move || {
            let _ = started_tx.send(());
        });

        let cancel = parent.child_token();
        let args = MlaunchArguments::new()
            .with(MlaunchArgument::TcpTunnel(port))
            .with(MlaunchArgument::DeviceName(device.to_string()));
        let command = self.processes.mlaunch_command(&args).timeout(timeout);
        let running = self
            .processes
            .spawn(command, OutputSinks::single(log), cancel.clone())
            .await?;

        let (exited_tx, exited_rx) = oneshot::channel();
        let tunnel_log = log.clone();
        let task = tokio::spawn(async move {
            let result = running.completion.await;
            match result {
                Ok(r) => tunnel_log.write_line(format!("TCP tunnel exited with {}", r.exit_code)),
                Err(e) => tunnel_log.write_line(format!("TCP tunnel failed: {}", e)),
            }
            let _ = exited_tx.send(());
        });

        self.tunnels
            .lock()
            .await
            .insert(device.to_string(), Tunnel { cancel, task });

        let started = tokio::select! {
            s = started_rx => s.is_ok(),
            _ = exited_rx => false,
        };
        drop(scan);

        if started {
            log.write_line(format!("TCP tunnel to {} started on port {}", device, port));
        } else {
            log.write_line(format!("TCP tunnel to {} could not be started", device));
        }
        Ok(started)
    }

    /// Stop the tunnel to `device`, if any, and wait for it to exit.
    pub async fn close(&self, device: &str) {
        let tunnel = self.tunnels.lock().await.remove(device);
        if let Some(tunnel) = tunnel {
            tunnel.cancel.cancel();
            if let Err(e) = tunnel.task.await {
                tracing::debug!(device, error = %e, "tunnel task failed");
            }
        }
    }

    pub async fn is_open(&self, device: &str) -> bool {
        self.tunnels.lock().await.contains_key(device)
    }
}
