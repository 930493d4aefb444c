use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Client -> Daemon request messages.
///
/// Each variant maps to a JSONL message with `"action"` as the tag field.
/// All requests carry an `id` field for response correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Request {
    Start {
        id: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
    },

    Stop {
        id: String,
        terminal: String,
        #[serde(default)]
        force: bool,
    },

    Stdin {
        id: String,
        terminal: String,
        data: String,
        #[serde(default)]
        is_key: bool,
    },

    Stdout {
        id: String,
        terminal: String,
        mode: StdoutMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<usize>,
    },

    Subscribe { id: String, terminal: String },

    Unsubscribe { id: String, terminal: String },

    List { id: String },

    Resize {
        id: String,
        terminal: String,
        cols: u16,
        rows: u16,
    },

    TermSize { id: String },

    KillServer { id: String },
}

impl Request {
    /// Extract the request ID from any request.
    pub fn id(&self) -> &str {
        match self {
            Request::Start { id, .. }
            | Request::Stop { id, .. }
            | Request::Stdin { id, .. }
            | Request::Stdout { id, .. }
            | Request::Subscribe { id, .. }
            | Request::Unsubscribe { id, .. }
            | Request::List { id, .. }
            | Request::Resize { id, .. }
            | Request::TermSize { id, .. }
            | Request::KillServer { id, .. } => id,
        }
    }
}

/// Which view of a terminal's output `stdout` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutMode {
    /// The rendered screen snapshot.
    Screen,
    /// The raw buffered byte stream, decoded as UTF-8 with replacement.
    Stream,
}

/// Kind of a streamed terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A chunk of terminal output.
    Output,
    /// The terminal's child process exited; `data` carries the exit code
    /// as a decimal string (empty when unknown).
    Exit,
}

/// Stable error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownAction,
    BadRequest,
    InvalidKey,
    UnknownTerminal,
    Exited,
    SpawnError,
    WriteError,
    ReadError,
    Timeout,
    Disconnected,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::UnknownAction => "UnknownAction",
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::InvalidKey => "InvalidKey",
            ErrorCode::UnknownTerminal => "UnknownTerminal",
            ErrorCode::Exited => "Exited",
            ErrorCode::SpawnError => "SpawnError",
            ErrorCode::WriteError => "WriteError",
            ErrorCode::ReadError => "ReadError",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::Disconnected => "Disconnected",
            ErrorCode::InternalError => "InternalError",
        };
        write!(f, "{}", s)
    }
}

/// Error payload inside a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Daemon -> Client messages: responses (carry the request `id`) and
/// streamed events (carry no `id`). Parsers discriminate on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Response {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Event {
        terminal: String,
        kind: EventKind,
        data: String,
    },
}

impl ServerMessage {
    /// Build a success response.
    pub fn ok(id: &str, result: serde_json::Value) -> Self {
        ServerMessage::Response {
            id: id.to_string(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build a success response with no result payload.
    pub fn ok_empty(id: &str) -> Self {
        ServerMessage::Response {
            id: id.to_string(),
            ok: true,
            result: None,
            error: None,
        }
    }

    /// Build an error response.
    pub fn err(id: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Response {
            id: id.to_string(),
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Build an output event.
    pub fn output_event(terminal: &str, data: impl Into<String>) -> Self {
        ServerMessage::Event {
            terminal: terminal.to_string(),
            kind: EventKind::Output,
            data: data.into(),
        }
    }

    /// Build an exit event. `data` is the exit code as a decimal string,
    /// or empty when the code is unknown.
    pub fn exit_event(terminal: &str, exit_code: Option<i32>) -> Self {
        ServerMessage::Event {
            terminal: terminal.to_string(),
            kind: EventKind::Exit,
            data: exit_code.map(|c| c.to_string()).unwrap_or_default(),
        }
    }
}

/// Summary of a managed terminal as returned by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub id: String,
    pub command: String,
    pub running: bool,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Dimensions of the daemon's controlling terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}
