//! Daemon auto-start: spawn a detached `terminalcp-daemon` and wait for
//! its socket to become reachable.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::{Client, ClientError, daemon_binary};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Check whether a live daemon answers on `socket_path`.
///
/// Connecting alone is not enough — a stale socket file accepts nothing,
/// and a half-dead daemon may accept but never respond. A benign `list`
/// request is the probe.
pub async fn probe_daemon(socket_path: &Path) -> bool {
    match Client::connect(socket_path).await {
        Ok(client) => client.with_timeout(PROBE_TIMEOUT).list().await.is_ok(),
        Err(_) => false,
    }
}

/// Ensure a daemon is running, spawning one if needed.
///
/// 1. Probes the daemon — if alive, returns immediately.
/// 2. Spawns the `terminalcp-daemon` binary detached (null stdio).
/// 3. Polls socket + probe with a 5 s deadline and 100 ms interval,
///    checking the child's exit status each iteration to surface early
///    crashes instead of waiting out the full timeout.
pub async fn ensure_daemon_running(socket_path: &Path) -> Result<(), ClientError> {
    if probe_daemon(socket_path).await {
        return Ok(());
    }

    info!(event = "client.autostart_started", socket = %socket_path.display());

    let binary = daemon_binary();
    let mut child = std::process::Command::new(&binary)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| ClientError::AutoStart {
            message: format!("failed to spawn {}: {}", binary.display(), e),
        })?;

    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(ClientError::AutoStart {
                    message: format!(
                        "daemon process exited with {} before becoming ready (binary: {})",
                        status,
                        binary.display()
                    ),
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(event = "client.autostart_child_status_failed", error = %e);
            }
        }

        if socket_path.exists() && probe_daemon(socket_path).await {
            info!(event = "client.autostart_completed");
            return Ok(());
        }

        if start.elapsed() > STARTUP_TIMEOUT {
            let message = if socket_path.exists() {
                "daemon socket exists but is not responding after 5s".to_string()
            } else {
                format!(
                    "daemon spawned but socket not created after 5s (binary: {})",
                    binary.display()
                )
            };
            return Err(ClientError::AutoStart { message });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("absent.sock");
        assert!(!probe_daemon(&sock_path).await);
    }

    #[tokio::test]
    async fn test_probe_unresponsive_listener() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("mute.sock");
        // Listener that accepts but never answers: probe must fail, not hang.
        let _listener = tokio::net::UnixListener::bind(&sock_path).unwrap();
        assert!(!probe_daemon(&sock_path).await);
    }

    #[test]
    fn test_autostart_error_display() {
        let err = ClientError::AutoStart {
            message: "socket not created".to_string(),
        };
        assert!(err.to_string().contains("socket not created"));
    }
}
