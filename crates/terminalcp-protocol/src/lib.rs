pub mod autostart;
pub mod client;
pub mod codec;
mod messages;

pub use client::{Client, ClientError, TerminalEvent};
pub use messages::{
    ErrorBody, ErrorCode, EventKind, Request, ServerMessage, StdoutMode, TermSize, TerminalInfo,
};
