use terminalcp_daemon::DaemonError;
use tracing::{error, info};

fn main() {
    terminalcp_daemon::init_logging();
    info!(event = "daemon.start_started");

    let exit_code = match run() {
        Ok(()) => {
            info!(event = "daemon.start_completed");
            0
        }
        Err(DaemonError::AlreadyRunning(socket)) => {
            // Benign: an auto-start race means another daemon won.
            info!(event = "daemon.already_running", socket = %socket);
            0
        }
        Err(e @ DaemonError::BindFailed(_)) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("terminalcp-daemon: {}", e);
            1
        }
        Err(e) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("terminalcp-daemon: {}", e);
            2
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), DaemonError> {
    let config = terminalcp_daemon::load_daemon_config()?;

    let rt = tokio::runtime::Runtime::new().map_err(DaemonError::Io)?;
    rt.block_on(terminalcp_daemon::run_server(config))
}
