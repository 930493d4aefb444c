use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::DaemonError;

/// Pieces of a freshly spawned PTY that leave the manager's ownership:
/// the reader and child go to the reader task, the writer becomes the
/// terminal's input lock.
pub struct SpawnParts {
    pub reader: Box<dyn std::io::Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    pub pid: Option<u32>,
}

/// Handle to a live PTY kept by the manager: the master (resize, fd
/// lifetime) and a killer for force-termination.
pub struct ManagedPty {
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    size: PtySize,
    pid: Option<u32>,
}

impl ManagedPty {
    pub fn size(&self) -> PtySize {
        self.size
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Resize the PTY (TIOCSWINSZ on the master) and nudge the child with
    /// SIGWINCH.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), DaemonError> {
        let new_size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .unwrap()
            .resize(new_size)
            .map_err(|e| DaemonError::Internal(format!("resize: {}", e)))?;
        self.size = new_size;
        self.signal(Signal::SIGWINCH);
        debug!(event = "daemon.pty.resize_completed", cols = cols, rows = rows);
        Ok(())
    }

    /// Send a signal to the child's process group. Best effort: a process
    /// that is already gone (ESRCH) is not an error.
    pub fn signal(&self, sig: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        let pgid = Pid::from_raw(pid as i32);
        match signal::killpg(pgid, sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => {
                warn!(
                    event = "daemon.pty.signal_failed",
                    pid = pid,
                    signal = %sig,
                    error = %e,
                );
            }
        }
    }

    /// Force-kill the child process.
    pub fn force_kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            warn!(event = "daemon.pty.kill_failed", error = %e);
        }
    }
}

/// Manages all live PTY instances in the daemon, keyed by terminal id.
pub struct PtyManager {
    ptys: HashMap<String, ManagedPty>,
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            ptys: HashMap::new(),
        }
    }

    /// Allocate a PTY and spawn `command` under `/bin/sh -c` with the
    /// slave end as its controlling terminal.
    ///
    /// The child environment is the daemon's, plus `TERM=xterm-256color`,
    /// minus `COLUMNS`/`LINES` (stale values confuse PTY clients), plus
    /// the per-start overrides (which win over everything).
    pub fn create(
        &mut self,
        terminal_id: &str,
        command: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> Result<SpawnParts, DaemonError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| DaemonError::SpawnError(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", command]);
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env_remove("COLUMNS");
        cmd.env_remove("LINES");
        for (key, value) in env {
            cmd.env(key, value);
        }

        info!(
            event = "daemon.pty.create_started",
            terminal = terminal_id,
            command = command,
            cols = cols,
            rows = rows,
        );

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DaemonError::SpawnError(format!("spawn: {}", e)))?;

        // The reader sees EOF when the child exits only if the daemon's
        // copy of the slave is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| DaemonError::SpawnError(format!("clone reader: {}", e)))?;

        // Take the writer once (portable-pty only allows one take_writer call).
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DaemonError::SpawnError(format!("take writer: {}", e)))?;

        self.ptys.insert(
            terminal_id.to_string(),
            ManagedPty {
                master: std::sync::Mutex::new(pair.master),
                killer,
                size,
                pid,
            },
        );

        info!(
            event = "daemon.pty.create_completed",
            terminal = terminal_id,
            pid = ?pid,
        );

        Ok(SpawnParts {
            reader,
            child,
            writer: Arc::new(Mutex::new(writer)),
            pid,
        })
    }

    pub fn get(&self, terminal_id: &str) -> Option<&ManagedPty> {
        self.ptys.get(terminal_id)
    }

    pub fn get_mut(&mut self, terminal_id: &str) -> Option<&mut ManagedPty> {
        self.ptys.get_mut(terminal_id)
    }

    /// Remove a PTY, dropping the master (closing the fd).
    pub fn remove(&mut self, terminal_id: &str) -> Option<ManagedPty> {
        let pty = self.ptys.remove(terminal_id);
        if pty.is_some() {
            debug!(event = "daemon.pty.remove_completed", terminal = terminal_id);
        }
        pty
    }

    pub fn count(&self) -> usize {
        self.ptys.len()
    }
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}
