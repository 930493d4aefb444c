pub mod emu;
pub mod errors;
pub mod keys;
pub mod logging;
pub mod pty;
pub mod server;
pub mod terminal;
pub mod types;

// Primary re-exports
pub use errors::DaemonError;
pub use logging::init_logging;
pub use server::run_server;
pub use types::{DaemonConfig, load_daemon_config};
