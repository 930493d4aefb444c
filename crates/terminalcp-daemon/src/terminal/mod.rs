pub mod manager;
pub mod state;

pub use manager::{TerminalManager, stop_all, stop_terminal};
pub use state::{ConnectionId, ManagedTerminal, TerminalState};
