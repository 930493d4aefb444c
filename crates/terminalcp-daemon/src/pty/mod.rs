pub mod manager;
pub mod output;

pub use manager::{ManagedPty, PtyManager};
pub use output::{PtyExitEvent, RawBuffer, ScreenState, spawn_pty_reader};
