use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found — set $HOME environment variable")]
    HomeNotFound,
}

/// Centralized path construction for the `~/.terminalcp/` directory layout.
///
/// Single source of truth for every path under `~/.terminalcp/`. Use
/// `resolve()` in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct TerminalcpPaths {
    base_dir: PathBuf,
}

impl TerminalcpPaths {
    /// Resolve paths from the user's home directory (`~/.terminalcp`).
    pub fn resolve() -> Result<Self, PathError> {
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            base_dir: home.join(".terminalcp"),
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// The base `~/.terminalcp` directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn server_socket(&self) -> PathBuf {
        self.base_dir.join("server.sock")
    }

    pub fn user_config(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }
}
