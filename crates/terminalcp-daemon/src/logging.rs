use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from `TERMINALCP_LOG` (fallback `info`). Output goes
/// to stderr: a detached daemon runs with stderr on /dev/null, a
/// foreground one shows structured events.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("TERMINALCP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
