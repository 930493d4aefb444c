use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use terminalcp_paths::TerminalcpPaths;

/// Daemon-specific configuration.
///
/// Read from the `[daemon]` section of `~/.terminalcp/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the Unix domain socket.
    /// Default: `~/.terminalcp/server.sock`
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Per-terminal raw output ring buffer size in bytes.
    /// Default: 2097152 (2 MiB)
    #[serde(default = "default_raw_buffer_bytes")]
    pub raw_buffer_bytes: usize,

    /// Emulator scrollback history in lines.
    /// Default: 10000
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,

    /// Per-connection outbound queue length in messages. A subscriber
    /// whose queue overflows is disconnected rather than stalling PTY
    /// readers.
    /// Default: 256
    #[serde(default = "default_event_queue_len")]
    pub event_queue_len: usize,

    /// Grace period in milliseconds between SIGTERM and SIGKILL when
    /// stopping a terminal.
    /// Default: 3000
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Delay in milliseconds after a stdin write containing a carriage
    /// return. Line-buffered interactive programs miss rapid successive
    /// inputs without it; this delay is part of the stdin contract.
    /// Default: 200
    #[serde(default = "default_enter_delay_ms")]
    pub enter_delay_ms: u64,
}

impl DaemonConfig {
    /// Validate configuration values.
    ///
    /// Called after loading config to catch misconfiguration early.
    pub fn validate(&self) -> Result<(), crate::errors::DaemonError> {
        if self.raw_buffer_bytes < 4096 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "raw_buffer_bytes must be >= 4096 (4 KB)".to_string(),
            ));
        }
        if self.raw_buffer_bytes > 268_435_456 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "raw_buffer_bytes must be <= 268435456 (256 MB)".to_string(),
            ));
        }
        if self.scrollback_lines == 0 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "scrollback_lines must be > 0".to_string(),
            ));
        }
        if self.event_queue_len < 16 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "event_queue_len must be >= 16".to_string(),
            ));
        }
        if self.stop_grace_ms == 0 {
            return Err(crate::errors::DaemonError::ConfigInvalid(
                "stop_grace_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            raw_buffer_bytes: default_raw_buffer_bytes(),
            scrollback_lines: default_scrollback_lines(),
            event_queue_len: default_event_queue_len(),
            stop_grace_ms: default_stop_grace_ms(),
            enter_delay_ms: default_enter_delay_ms(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    TerminalcpPaths::resolve()
        .unwrap_or_else(|e| {
            tracing::warn!(
                event = "daemon.config.socket_path_fallback",
                error = %e,
                fallback = "/tmp/.terminalcp",
            );
            TerminalcpPaths::from_dir(PathBuf::from("/tmp/.terminalcp"))
        })
        .server_socket()
}

fn default_raw_buffer_bytes() -> usize {
    2_097_152
}

fn default_scrollback_lines() -> usize {
    10_000
}

fn default_event_queue_len() -> usize {
    256
}

fn default_stop_grace_ms() -> u64 {
    3_000
}

fn default_enter_delay_ms() -> u64 {
    200
}

/// Wrapper for deserializing the `[daemon]` section from the config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

/// Load daemon configuration from `~/.terminalcp/config.toml`.
///
/// Reads the `[daemon]` section from the user's config file. Falls back to
/// defaults if the file doesn't exist or the section is missing.
pub fn load_daemon_config() -> Result<DaemonConfig, crate::errors::DaemonError> {
    let config_path = TerminalcpPaths::resolve()
        .unwrap_or_else(|e| {
            tracing::warn!(
                event = "daemon.config.home_dir_fallback",
                error = %e,
                fallback = "/tmp/.terminalcp",
            );
            TerminalcpPaths::from_dir(PathBuf::from("/tmp/.terminalcp"))
        })
        .user_config();

    let config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.daemon,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}
