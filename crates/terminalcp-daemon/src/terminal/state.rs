use std::collections::HashSet;
use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;

use crate::pty::output::ScreenState;
use terminalcp_protocol::TerminalInfo;

/// Unique identifier for a connected client.
pub type ConnectionId = u64;

/// Lifecycle state of a managed terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Starting,
    Running,
    Exited,
    Reaped,
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalState::Starting => write!(f, "starting"),
            TerminalState::Running => write!(f, "running"),
            TerminalState::Exited => write!(f, "exited"),
            TerminalState::Reaped => write!(f, "reaped"),
        }
    }
}

/// Serialized writer to a terminal's PTY master. Holding the lock across a
/// whole write (plus the post-Enter delay) is what gives concurrent stdin
/// callers well-ordered keystrokes.
pub type InputHandle = Arc<tokio::sync::Mutex<Box<dyn Write + Send>>>;

/// One record per spawned process: metadata, lifecycle state, the screen
/// state behind its lock, the input handle, and the subscriber set.
///
/// The daemon is PTY-centric: it knows about commands and byte streams,
/// not about what runs inside them.
pub struct ManagedTerminal {
    id: String,
    command: String,
    cwd: Option<String>,
    env: Vec<(String, String)>,
    created_at: String,
    exited_at: Option<String>,
    state: TerminalState,
    cols: u16,
    rows: u16,
    pid: Option<u32>,
    exit_code: Option<i32>,
    /// Raw ring + emulator, fed by the reader task under this lock.
    screen: Arc<StdMutex<ScreenState>>,
    /// Input lock. Only present while Running.
    writer: Option<InputHandle>,
    /// Broadcast sender for output distribution. Only present while Running.
    output_tx: Option<broadcast::Sender<Vec<u8>>>,
    /// Connections subscribed to output events.
    subscribers: HashSet<ConnectionId>,
}

impl ManagedTerminal {
    /// Create a new terminal record in Starting state.
    pub fn new(
        id: String,
        command: String,
        cwd: Option<String>,
        env: Vec<(String, String)>,
        cols: u16,
        rows: u16,
        created_at: String,
        screen: Arc<StdMutex<ScreenState>>,
    ) -> Self {
        Self {
            id,
            command,
            cwd,
            env,
            created_at,
            exited_at: None,
            state: TerminalState::Starting,
            cols,
            rows,
            pid: None,
            exit_code: None,
            screen,
            writer: None,
            output_tx: None,
            subscribers: HashSet::new(),
        }
    }

    // --- Getters ---

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TerminalState {
        self.state
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn exited_at(&self) -> Option<&str> {
        self.exited_at.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn is_running(&self) -> bool {
        self.state == TerminalState::Running
    }

    /// Shared handle to the screen state for the reader task and stdout reads.
    pub fn screen_handle(&self) -> Arc<StdMutex<ScreenState>> {
        self.screen.clone()
    }

    /// The input lock, while running.
    pub fn writer_handle(&self) -> Option<InputHandle> {
        self.writer.clone()
    }

    // --- State transitions ---

    /// Transition to Running with the input handle and output channel.
    pub fn set_running(
        &mut self,
        writer: InputHandle,
        output_tx: broadcast::Sender<Vec<u8>>,
        pid: Option<u32>,
    ) {
        debug_assert!(
            matches!(self.state, TerminalState::Starting),
            "set_running called on non-Starting terminal (state: {:?})",
            self.state
        );
        self.state = TerminalState::Running;
        self.writer = Some(writer);
        self.output_tx = Some(output_tx);
        self.pid = pid;
    }

    /// Transition to Exited, recording the exit code. Dropping the output
    /// sender here is what lets event forwarders observe the closure.
    /// Idempotent: calling on an already-exited terminal is a no-op.
    pub fn set_exited(&mut self, exit_code: Option<i32>, exited_at: String) {
        if matches!(self.state, TerminalState::Exited | TerminalState::Reaped) {
            return;
        }
        self.state = TerminalState::Exited;
        self.exit_code = exit_code;
        self.exited_at = Some(exited_at);
        self.writer = None;
        self.output_tx = None;
    }

    /// Transition to Reaped just before the record is dropped.
    pub fn set_reaped(&mut self) {
        self.state = TerminalState::Reaped;
        self.writer = None;
        self.output_tx = None;
        self.subscribers.clear();
    }

    // --- Subscribers ---

    pub fn attach_subscriber(&mut self, connection: ConnectionId) {
        self.subscribers.insert(connection);
    }

    pub fn detach_subscriber(&mut self, connection: ConnectionId) {
        self.subscribers.remove(&connection);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Subscribe to output chunks. Returns `None` when not running.
    pub fn subscribe_output(&self) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.output_tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Convert to the wire format.
    pub fn to_info(&self) -> TerminalInfo {
        TerminalInfo {
            id: self.id.clone(),
            command: self.command.clone(),
            running: self.is_running(),
            cols: self.cols,
            rows: self.rows,
            pid: self.pid,
            exit_code: self.exit_code,
        }
    }

    /// Record new dimensions after a successful resize.
    pub fn set_size(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_terminal() -> ManagedTerminal {
        let screen = Arc::new(StdMutex::new(ScreenState::new(80, 24, 100, 1024)));
        ManagedTerminal::new(
            "t1".to_string(),
            "bash".to_string(),
            Some("/tmp".to_string()),
            vec![("FOO".to_string(), "bar".to_string())],
            80,
            24,
            "2026-08-01T10:00:00Z".to_string(),
            screen,
        )
    }

    fn dummy_writer() -> InputHandle {
        Arc::new(tokio::sync::Mutex::new(
            Box::new(Vec::new()) as Box<dyn Write + Send>
        ))
    }

    #[test]
    fn test_new_terminal_starts_starting() {
        let terminal = test_terminal();
        assert_eq!(terminal.state(), TerminalState::Starting);
        assert!(!terminal.is_running());
        assert!(terminal.writer_handle().is_none());
        assert!(terminal.subscribe_output().is_none());
        assert_eq!(terminal.subscriber_count(), 0);
        assert_eq!(terminal.cwd(), Some("/tmp"));
        assert_eq!(terminal.env().len(), 1);
    }

    #[test]
    fn test_set_running() {
        let mut terminal = test_terminal();
        let (tx, _) = broadcast::channel(16);
        terminal.set_running(dummy_writer(), tx, Some(12345));
        assert_eq!(terminal.state(), TerminalState::Running);
        assert!(terminal.is_running());
        assert!(terminal.writer_handle().is_some());
        assert!(terminal.subscribe_output().is_some());
        assert_eq!(terminal.pid(), Some(12345));
    }

    #[test]
    fn test_set_exited() {
        let mut terminal = test_terminal();
        let (tx, _) = broadcast::channel(16);
        terminal.set_running(dummy_writer(), tx, Some(12345));
        terminal.set_exited(Some(0), "2026-08-01T10:05:00Z".to_string());
        assert_eq!(terminal.state(), TerminalState::Exited);
        assert_eq!(terminal.exit_code(), Some(0));
        assert_eq!(terminal.exited_at(), Some("2026-08-01T10:05:00Z"));
        assert!(terminal.writer_handle().is_none());
        assert!(terminal.subscribe_output().is_none());
    }

    #[test]
    fn test_set_exited_idempotent() {
        let mut terminal = test_terminal();
        let (tx, _) = broadcast::channel(16);
        terminal.set_running(dummy_writer(), tx, None);
        terminal.set_exited(Some(1), "2026-08-01T10:05:00Z".to_string());
        terminal.set_exited(Some(99), "2026-08-01T10:06:00Z".to_string());
        // First exit wins.
        assert_eq!(terminal.exit_code(), Some(1));
        assert_eq!(terminal.exited_at(), Some("2026-08-01T10:05:00Z"));
    }

    #[test]
    fn test_exited_closes_output_channel() {
        let mut terminal = test_terminal();
        let (tx, _) = broadcast::channel(16);
        terminal.set_running(dummy_writer(), tx, None);
        let mut rx = terminal.subscribe_output().unwrap();
        terminal.set_exited(Some(0), "2026-08-01T10:05:00Z".to_string());
        // The record's sender was the last one; receivers observe closure.
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_subscriber_tracking() {
        let mut terminal = test_terminal();
        terminal.attach_subscriber(1);
        terminal.attach_subscriber(2);
        terminal.attach_subscriber(1);
        assert_eq!(terminal.subscriber_count(), 2);

        terminal.detach_subscriber(1);
        assert_eq!(terminal.subscriber_count(), 1);
    }

    #[test]
    fn test_set_reaped_clears_subscribers() {
        let mut terminal = test_terminal();
        terminal.attach_subscriber(7);
        terminal.set_reaped();
        assert_eq!(terminal.state(), TerminalState::Reaped);
        assert_eq!(terminal.subscriber_count(), 0);
    }

    #[test]
    fn test_to_info() {
        let mut terminal = test_terminal();
        let (tx, _) = broadcast::channel(16);
        terminal.set_running(dummy_writer(), tx, Some(4242));

        let info = terminal.to_info();
        assert_eq!(info.id, "t1");
        assert_eq!(info.command, "bash");
        assert!(info.running);
        assert_eq!(info.cols, 80);
        assert_eq!(info.rows, 24);
        assert_eq!(info.pid, Some(4242));
        assert!(info.exit_code.is_none());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TerminalState::Starting.to_string(), "starting");
        assert_eq!(TerminalState::Running.to_string(), "running");
        assert_eq!(TerminalState::Exited.to_string(), "exited");
        assert_eq!(TerminalState::Reaped.to_string(), "reaped");
    }
}
