use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for a terminating signal (SIGTERM or SIGINT/Ctrl-C) and cancel
/// the token so all tasks drain gracefully. The daemon is Unix-only.
pub async fn wait_for_shutdown_signal(token: CancellationToken) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(event = "daemon.server.signal_received", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(event = "daemon.server.signal_received", signal = "SIGTERM");
        }
    }

    token.cancel();
}
