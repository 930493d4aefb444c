use std::io;

use terminalcp_protocol::ErrorCode;

/// All error types for the terminalcp-daemon crate.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid key token: {0}")]
    InvalidKey(String),

    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),

    #[error("terminal exited: {0}")]
    Exited(String),

    #[error("spawn failed: {0}")]
    SpawnError(String),

    #[error("write failed: {0}")]
    WriteError(String),

    #[error("read failed: {0}")]
    ReadError(String),

    #[error("daemon already running on socket {0}")]
    AlreadyRunning(String),

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DaemonError {
    /// Wire error code for the IPC protocol.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DaemonError::UnknownAction(_) => ErrorCode::UnknownAction,
            DaemonError::BadRequest(_) => ErrorCode::BadRequest,
            DaemonError::InvalidKey(_) => ErrorCode::InvalidKey,
            DaemonError::UnknownTerminal(_) => ErrorCode::UnknownTerminal,
            DaemonError::Exited(_) => ErrorCode::Exited,
            DaemonError::SpawnError(_) => ErrorCode::SpawnError,
            DaemonError::WriteError(_) => ErrorCode::WriteError,
            DaemonError::ReadError(_) => ErrorCode::ReadError,
            // Startup and plumbing failures never reach a response frame
            // through normal dispatch; map them to InternalError if they do.
            DaemonError::AlreadyRunning(_)
            | DaemonError::BindFailed(_)
            | DaemonError::ConfigInvalid(_)
            | DaemonError::Internal(_)
            | DaemonError::Io(_)
            | DaemonError::Serde(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error is caused by client input (logged at debug, not warn).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DaemonError::UnknownAction(_)
                | DaemonError::BadRequest(_)
                | DaemonError::InvalidKey(_)
                | DaemonError::UnknownTerminal(_)
                | DaemonError::Exited(_)
        )
    }
}
