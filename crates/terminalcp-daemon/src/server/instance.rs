//! Single-instance socket binding.
//!
//! File presence proves nothing: a socket file may be left behind by a
//! crashed daemon. Bind first; on address-in-use, probe the socket with a
//! benign request, and only unlink when nothing answers.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::errors::DaemonError;

/// Bind the daemon socket with single-instance semantics.
///
/// - Creates the parent directory with mode 0700.
/// - On `EADDRINUSE`: probes with a `list` request. A live daemon means
///   this process must exit (`AlreadyRunning`); a dead socket is unlinked
///   and the bind retried once.
/// - The bound socket gets mode 0600.
pub async fn bind_socket(socket_path: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DaemonError::BindFailed(format!("create {}: {}", parent.display(), e)))?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| DaemonError::BindFailed(format!("chmod {}: {}", parent.display(), e)))?;
    }

    let listener = match UnixListener::bind(socket_path) {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if terminalcp_protocol::autostart::probe_daemon(socket_path).await {
                return Err(DaemonError::AlreadyRunning(
                    socket_path.display().to_string(),
                ));
            }
            warn!(
                event = "daemon.server.stale_socket_removed",
                socket = %socket_path.display(),
            );
            std::fs::remove_file(socket_path).map_err(|e| {
                DaemonError::BindFailed(format!("unlink {}: {}", socket_path.display(), e))
            })?;
            UnixListener::bind(socket_path).map_err(|e| {
                DaemonError::BindFailed(format!("rebind {}: {}", socket_path.display(), e))
            })?
        }
        Err(e) => {
            return Err(DaemonError::BindFailed(format!(
                "bind {}: {}",
                socket_path.display(),
                e
            )));
        }
    };

    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).map_err(
        |e| DaemonError::BindFailed(format!("chmod {}: {}", socket_path.display(), e)),
    )?;

    info!(
        event = "daemon.server.socket_bound",
        socket = %socket_path.display(),
    );
    Ok(listener)
}
