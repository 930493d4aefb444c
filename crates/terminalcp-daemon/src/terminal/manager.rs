use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::pty::manager::PtyManager;
use crate::pty::output::{PtyExitEvent, ScreenState, spawn_pty_reader};
use crate::terminal::state::{ConnectionId, InputHandle, ManagedTerminal, TerminalState};
use crate::types::DaemonConfig;
use terminalcp_protocol::TerminalInfo;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Outcome of the synchronous half of a stop operation.
pub enum StopOutcome {
    /// The terminal had already exited; its record is now removed.
    AlreadyGone,
    /// A termination signal was sent; the caller waits out the grace period.
    Signaled,
}

/// The registry and lifecycle engine: spawns, tracks, resizes, signals,
/// and reaps terminals, and serves handles for I/O against them.
pub struct TerminalManager {
    terminals: HashMap<String, ManagedTerminal>,
    /// Terminal ids in creation order, for `list`.
    order: Vec<String>,
    pty_manager: PtyManager,
    config: DaemonConfig,
    next_terminal: u64,
    next_connection: ConnectionId,
    /// Sender for PTY exit notifications. Passed to each reader task.
    exit_tx: mpsc::UnboundedSender<PtyExitEvent>,
}

impl TerminalManager {
    pub fn new(config: DaemonConfig, exit_tx: mpsc::UnboundedSender<PtyExitEvent>) -> Self {
        Self {
            terminals: HashMap::new(),
            order: Vec::new(),
            pty_manager: PtyManager::new(),
            config,
            next_terminal: 1,
            next_connection: 1,
            exit_tx,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Allocate a new client connection ID.
    pub fn next_connection_id(&mut self) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection += 1;
        id
    }

    /// Spawn a command in a fresh PTY and register the terminal.
    ///
    /// Returns the assigned terminal id. On spawn failure no record is
    /// registered (starting goes straight to reaped).
    pub fn start(
        &mut self,
        command: &str,
        cols: Option<u16>,
        rows: Option<u16>,
        cwd: Option<String>,
        env: Vec<(String, String)>,
    ) -> Result<String, DaemonError> {
        let cols = cols.unwrap_or(DEFAULT_COLS);
        let rows = rows.unwrap_or(DEFAULT_ROWS);
        if cols == 0 || rows == 0 {
            return Err(DaemonError::BadRequest(
                "cols and rows must be non-zero".to_string(),
            ));
        }

        let id = format!("t{}", self.next_terminal);
        self.next_terminal += 1;

        info!(
            event = "daemon.terminal.start_started",
            terminal = %id,
            command = command,
            cwd = ?cwd,
            cols = cols,
            rows = rows,
        );

        let screen = Arc::new(StdMutex::new(ScreenState::new(
            cols,
            rows,
            self.config.scrollback_lines,
            self.config.raw_buffer_bytes,
        )));

        let mut terminal = ManagedTerminal::new(
            id.clone(),
            command.to_string(),
            cwd.clone(),
            env.clone(),
            cols,
            rows,
            chrono::Utc::now().to_rfc3339(),
            screen.clone(),
        );

        let parts = self
            .pty_manager
            .create(&id, command, cols, rows, cwd.as_deref(), &env)?;

        let (output_tx, _) = broadcast::channel(64);

        spawn_pty_reader(
            id.clone(),
            parts.reader,
            parts.child,
            screen,
            output_tx.clone(),
            self.exit_tx.clone(),
        );

        terminal.set_running(parts.writer, output_tx, parts.pid);

        self.terminals.insert(id.clone(), terminal);
        self.order.push(id.clone());

        info!(
            event = "daemon.terminal.start_completed",
            terminal = %id,
        );

        Ok(id)
    }

    fn get(&self, id: &str) -> Result<&ManagedTerminal, DaemonError> {
        self.terminals
            .get(id)
            .ok_or_else(|| DaemonError::UnknownTerminal(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut ManagedTerminal, DaemonError> {
        self.terminals
            .get_mut(id)
            .ok_or_else(|| DaemonError::UnknownTerminal(id.to_string()))
    }

    /// The input lock for a running terminal's PTY.
    pub fn writer_handle(&self, id: &str) -> Result<InputHandle, DaemonError> {
        let terminal = self.get(id)?;
        if !terminal.is_running() {
            return Err(DaemonError::Exited(id.to_string()));
        }
        terminal
            .writer_handle()
            .ok_or_else(|| DaemonError::Internal(format!("running terminal {} has no writer", id)))
    }

    /// The screen state handle. Exited terminals stay readable until reaped.
    pub fn screen_handle(
        &self,
        id: &str,
    ) -> Result<Arc<StdMutex<ScreenState>>, DaemonError> {
        Ok(self.get(id)?.screen_handle())
    }

    /// Subscribe a connection to a terminal's output events.
    pub fn subscribe(
        &mut self,
        id: &str,
        connection: ConnectionId,
    ) -> Result<broadcast::Receiver<Vec<u8>>, DaemonError> {
        let terminal = self.get_mut(id)?;
        if !terminal.is_running() {
            return Err(DaemonError::Exited(id.to_string()));
        }
        let rx = terminal
            .subscribe_output()
            .ok_or_else(|| DaemonError::Internal(format!("running terminal {} has no output", id)))?;
        terminal.attach_subscriber(connection);
        debug!(
            event = "daemon.terminal.subscribed",
            terminal = id,
            connection = connection,
            subscribers = terminal.subscriber_count(),
        );
        Ok(rx)
    }

    /// Remove a connection's subscription.
    pub fn unsubscribe(&mut self, id: &str, connection: ConnectionId) -> Result<(), DaemonError> {
        let terminal = self.get_mut(id)?;
        terminal.detach_subscriber(connection);
        debug!(
            event = "daemon.terminal.unsubscribed",
            terminal = id,
            connection = connection,
        );
        Ok(())
    }

    /// Drop all subscriptions of a closing connection.
    pub fn detach_connection(&mut self, connection: ConnectionId) {
        for terminal in self.terminals.values_mut() {
            terminal.detach_subscriber(connection);
        }
    }

    /// Resize a running terminal: PTY, emulator, and record.
    pub fn resize(&mut self, id: &str, cols: u16, rows: u16) -> Result<(), DaemonError> {
        if cols == 0 || rows == 0 {
            return Err(DaemonError::BadRequest(
                "cols and rows must be non-zero".to_string(),
            ));
        }
        if !self.get(id)?.is_running() {
            return Err(DaemonError::Exited(id.to_string()));
        }
        let pty = self
            .pty_manager
            .get_mut(id)
            .ok_or_else(|| DaemonError::Internal(format!("running terminal {} has no pty", id)))?;
        pty.resize(cols, rows)?;

        let terminal = self.get_mut(id)?;
        let screen = terminal.screen_handle();
        {
            let mut guard = match screen.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.emulator.resize(cols, rows);
        }
        terminal.set_size(cols, rows);

        info!(
            event = "daemon.terminal.resize_completed",
            terminal = id,
            cols = cols,
            rows = rows,
        );
        Ok(())
    }

    /// All known terminals in creation order.
    pub fn list(&self) -> Vec<TerminalInfo> {
        self.order
            .iter()
            .filter_map(|id| self.terminals.get(id))
            .map(|t| t.to_info())
            .collect()
    }

    pub fn exit_code(&self, id: &str) -> Option<i32> {
        self.terminals.get(id).and_then(|t| t.exit_code())
    }

    /// True once the terminal is no longer running (or no longer known).
    pub fn terminal_finished(&self, id: &str) -> bool {
        match self.terminals.get(id) {
            Some(t) => !t.is_running(),
            None => true,
        }
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Ids of all currently running terminals.
    pub fn running_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.terminals
                    .get(id.as_str())
                    .is_some_and(|t| t.is_running())
            })
            .cloned()
            .collect()
    }

    /// Handle a PTY exit: record the exit code and release the PTY.
    ///
    /// Dropping the record's output sender (inside `set_exited`) together
    /// with the reader task's clone closes the broadcast channel, which is
    /// how event forwarders learn the terminal is done.
    pub fn handle_pty_exit(&mut self, event: PtyExitEvent) {
        info!(
            event = "daemon.terminal.exited",
            terminal = %event.terminal,
            exit_code = ?event.exit_code,
        );
        self.pty_manager.remove(&event.terminal);
        if let Some(terminal) = self.terminals.get_mut(&event.terminal) {
            terminal.set_exited(event.exit_code, chrono::Utc::now().to_rfc3339());
        }
    }

    /// Synchronous half of stop: signal the child or remove an already
    /// exited record. The async half ([`stop_terminal`]) waits the grace
    /// period and reaps.
    pub fn begin_stop(&mut self, id: &str, force: bool) -> Result<StopOutcome, DaemonError> {
        let state = self.get(id)?.state();
        match state {
            TerminalState::Exited => {
                self.finish_reap(id);
                Ok(StopOutcome::AlreadyGone)
            }
            _ => {
                let sig = if force {
                    Signal::SIGKILL
                } else {
                    Signal::SIGTERM
                };
                if let Some(pty) = self.pty_manager.get(id) {
                    pty.signal(sig);
                }
                info!(
                    event = "daemon.terminal.stop_signaled",
                    terminal = id,
                    signal = %sig,
                );
                Ok(StopOutcome::Signaled)
            }
        }
    }

    /// Escalate to SIGKILL after the grace period expired.
    pub fn force_kill(&mut self, id: &str) {
        if let Some(pty) = self.pty_manager.get_mut(id) {
            warn!(event = "daemon.terminal.stop_escalated", terminal = id);
            pty.force_kill();
        }
    }

    /// Remove a terminal's record and PTY resources.
    pub fn finish_reap(&mut self, id: &str) {
        if let Some(mut terminal) = self.terminals.remove(id) {
            terminal.set_reaped();
        }
        self.order.retain(|known| known != id);
        self.pty_manager.remove(id);
        info!(event = "daemon.terminal.reaped", terminal = id);
    }
}

/// Stop one terminal: signal, wait up to the configured grace period for
/// the reader to observe exit, escalate to SIGKILL, then reap the record.
///
/// Runs outside the manager lock so the server loop keeps processing PTY
/// exit events (and other clients' requests) during the wait.
pub async fn stop_terminal(
    manager: &Arc<RwLock<TerminalManager>>,
    id: &str,
    force: bool,
) -> Result<(), DaemonError> {
    let grace = {
        let mut mgr = manager.write().await;
        match mgr.begin_stop(id, force)? {
            StopOutcome::AlreadyGone => return Ok(()),
            StopOutcome::Signaled => Duration::from_millis(mgr.config().stop_grace_ms),
        }
    };

    if !wait_finished(manager, id, grace).await {
        manager.write().await.force_kill(id);
        // A SIGKILLed child still needs a moment for the reader to see EOF.
        wait_finished(manager, id, Duration::from_millis(500)).await;
    }

    manager.write().await.finish_reap(id);
    Ok(())
}

/// Stop all running terminals (graceful shutdown): SIGTERM everything,
/// wait out one shared grace period, SIGKILL stragglers, reap all records.
pub async fn stop_all(manager: &Arc<RwLock<TerminalManager>>) {
    let (ids, grace) = {
        let mgr = manager.read().await;
        (
            mgr.running_ids(),
            Duration::from_millis(mgr.config().stop_grace_ms),
        )
    };

    if !ids.is_empty() {
        {
            let mut mgr = manager.write().await;
            for id in &ids {
                if let Err(e) = mgr.begin_stop(id, false) {
                    warn!(
                        event = "daemon.terminal.shutdown_stop_failed",
                        terminal = %id,
                        error = %e,
                    );
                }
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let all_done = {
                let mgr = manager.read().await;
                ids.iter().all(|id| mgr.terminal_finished(id))
            };
            if all_done || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        {
            let mut mgr = manager.write().await;
            for id in &ids {
                if !mgr.terminal_finished(id) {
                    mgr.force_kill(id);
                }
            }
        }
    }

    // Reap every record, exited or not; the daemon is going away.
    let all_ids: Vec<String> = {
        let mgr = manager.read().await;
        mgr.order.clone()
    };
    let mut mgr = manager.write().await;
    for id in &all_ids {
        mgr.finish_reap(id);
    }
}

async fn wait_finished(
    manager: &Arc<RwLock<TerminalManager>>,
    id: &str,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if manager.read().await.terminal_finished(id) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> (TerminalManager, mpsc::UnboundedReceiver<PtyExitEvent>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let mut config = DaemonConfig::default();
        config.stop_grace_ms = 500;
        (TerminalManager::new(config, exit_tx), exit_rx)
    }

    #[test]
    fn test_unknown_terminal_errors() {
        let (mgr, _rx) = test_manager();
        assert!(matches!(
            mgr.writer_handle("t99"),
            Err(DaemonError::UnknownTerminal(_))
        ));
        assert!(matches!(
            mgr.screen_handle("t99"),
            Err(DaemonError::UnknownTerminal(_))
        ));
    }

    #[test]
    fn test_list_empty() {
        let (mgr, _rx) = test_manager();
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn test_connection_ids_monotonic() {
        let (mut mgr, _rx) = test_manager();
        let a = mgr.next_connection_id();
        let b = mgr.next_connection_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_start_assigns_sequential_ids() {
        let (mut mgr, _rx) = test_manager();
        let id1 = mgr.start("sleep 5", None, None, None, vec![]).unwrap();
        let id2 = mgr.start("sleep 5", None, None, None, vec![]).unwrap();
        assert_eq!(id1, "t1");
        assert_eq!(id2, "t2");

        let infos = mgr.list();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "t1");
        assert_eq!(infos[1].id, "t2");
        assert!(infos[0].running);
        assert!(infos[0].pid.is_some());

        mgr.begin_stop("t1", true).unwrap();
        mgr.begin_stop("t2", true).unwrap();
        mgr.finish_reap("t1");
        mgr.finish_reap("t2");
    }

    #[tokio::test]
    async fn test_start_bad_dimensions() {
        let (mut mgr, _rx) = test_manager();
        let result = mgr.start("true", Some(0), None, None, vec![]);
        assert!(matches!(result, Err(DaemonError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_record() {
        let (mut mgr, _rx) = test_manager();
        let result = mgr.start("true", None, None, Some("/no/such/dir".to_string()), vec![]);
        assert!(matches!(result, Err(DaemonError::SpawnError(_))));
        assert!(mgr.list().is_empty());
        assert_eq!(mgr.terminal_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_flow_updates_record() {
        let (mut mgr, mut exit_rx) = test_manager();
        let id = mgr.start("exit 7", None, None, None, vec![]).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .expect("reader should report exit")
            .expect("channel open");
        assert_eq!(event.terminal, id);
        assert_eq!(event.exit_code, Some(7));

        mgr.handle_pty_exit(event);
        let infos = mgr.list();
        assert_eq!(infos.len(), 1);
        assert!(!infos[0].running);
        assert_eq!(infos[0].exit_code, Some(7));

        // Exited terminals reject stdin but keep their screen readable.
        assert!(matches!(
            mgr.writer_handle(&id),
            Err(DaemonError::Exited(_))
        ));
        assert!(mgr.screen_handle(&id).is_ok());
    }

    #[tokio::test]
    async fn test_stop_terminal_reaps() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut config = DaemonConfig::default();
        config.stop_grace_ms = 2_000;
        let manager = Arc::new(RwLock::new(TerminalManager::new(config, exit_tx)));

        let id = manager
            .write()
            .await
            .start("sleep 30", None, None, None, vec![])
            .unwrap();

        // Pump exit events into the manager like the server loop does.
        let pump_mgr = manager.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                pump_mgr.write().await.handle_pty_exit(event);
            }
        });

        stop_terminal(&manager, &id, false).await.unwrap();

        let mgr = manager.read().await;
        assert!(mgr.list().is_empty());
        assert!(matches!(
            mgr.writer_handle(&id),
            Err(DaemonError::UnknownTerminal(_))
        ));
        drop(mgr);
        pump.abort();
    }

    #[tokio::test]
    async fn test_stop_idempotence() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(RwLock::new(TerminalManager::new(
            DaemonConfig::default(),
            exit_tx,
        )));

        let id = manager
            .write()
            .await
            .start("true", None, None, None, vec![])
            .unwrap();

        let pump_mgr = manager.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                pump_mgr.write().await.handle_pty_exit(event);
            }
        });

        stop_terminal(&manager, &id, false).await.unwrap();

        // Second stop: the id is gone.
        let result = stop_terminal(&manager, &id, false).await;
        assert!(matches!(result, Err(DaemonError::UnknownTerminal(_))));
        assert!(manager.read().await.list().is_empty());
        pump.abort();
    }

    #[tokio::test]
    async fn test_subscribe_and_detach() {
        let (mut mgr, _rx) = test_manager();
        let id = mgr.start("sleep 5", None, None, None, vec![]).unwrap();

        let _rx1 = mgr.subscribe(&id, 1).unwrap();
        let _rx2 = mgr.subscribe(&id, 2).unwrap();

        mgr.detach_connection(1);
        mgr.unsubscribe(&id, 2).unwrap();

        assert!(matches!(
            mgr.subscribe("t99", 1),
            Err(DaemonError::UnknownTerminal(_))
        ));

        mgr.begin_stop(&id, true).unwrap();
        mgr.finish_reap(&id);
    }

    #[tokio::test]
    async fn test_resize_running_terminal() {
        let (mut mgr, _rx) = test_manager();
        let id = mgr.start("sleep 5", None, None, None, vec![]).unwrap();

        mgr.resize(&id, 132, 50).unwrap();
        let info = &mgr.list()[0];
        assert_eq!(info.cols, 132);
        assert_eq!(info.rows, 50);

        assert!(matches!(
            mgr.resize(&id, 0, 50),
            Err(DaemonError::BadRequest(_))
        ));

        mgr.begin_stop(&id, true).unwrap();
        mgr.finish_reap(&id);
    }
}
