pub mod connection;
pub mod instance;
pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::DaemonError;
use crate::terminal::manager::{TerminalManager, stop_all};
use crate::types::DaemonConfig;

/// Run the daemon server.
///
/// 1. Binds the Unix socket with single-instance semantics (probe before
///    unlinking anything).
/// 2. Accepts client connections in a loop, multiplexed with PTY exit
///    notifications from reader tasks and the shutdown token.
/// 3. On `kill-server` or SIGTERM/SIGINT: stops accepting, terminates all
///    managed terminals with stop semantics, unlinks the socket, returns.
pub async fn run_server(config: DaemonConfig) -> Result<(), DaemonError> {
    let socket_path = config.socket_path.clone();
    let listener = instance::bind_socket(&socket_path).await?;

    // Channel for PTY exit notifications from reader tasks.
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

    let manager = Arc::new(RwLock::new(TerminalManager::new(config, exit_tx)));
    let shutdown = CancellationToken::new();

    tokio::spawn(shutdown::wait_for_shutdown_signal(shutdown.clone()));

    info!(
        event = "daemon.server.started",
        pid = std::process::id(),
        socket = %socket_path.display(),
    );

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        tokio::spawn(connection::handle_connection(
                            stream,
                            manager.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(
                            event = "daemon.server.accept_failed",
                            error = %e,
                        );
                        // Brief sleep to avoid a tight spin on fatal accept
                        // errors (EMFILE, ENOMEM) that cannot be resolved
                        // immediately.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            Some(event) = exit_rx.recv() => {
                manager.write().await.handle_pty_exit(event);
            }
            _ = shutdown.cancelled() => {
                info!(event = "daemon.server.shutdown_started");
                break;
            }
        }
    }

    // Stop accepting before reaping children.
    drop(listener);

    // Terminate all terminals, still servicing reader-exit events so the
    // grace wait can observe children going away.
    {
        let stop_fut = stop_all(&manager);
        tokio::pin!(stop_fut);
        loop {
            tokio::select! {
                _ = &mut stop_fut => break,
                Some(event) = exit_rx.recv() => {
                    manager.write().await.handle_pty_exit(event);
                }
            }
        }
    }

    if socket_path.exists()
        && let Err(e) = std::fs::remove_file(&socket_path)
    {
        error!(
            event = "daemon.server.socket_cleanup_failed",
            error = %e,
        );
    }

    info!(event = "daemon.server.shutdown_completed");
    Ok(())
}
