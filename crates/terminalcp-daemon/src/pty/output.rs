use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::emu::ScreenEmulator;

/// Bounded ring of raw PTY output bytes. Oldest bytes are discarded at
/// capacity; the event stream is unaffected by eviction.
pub struct RawBuffer {
    buffer: VecDeque<u8>,
    capacity: usize,
}

impl RawBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append bytes, evicting the oldest data if full.
    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            self.buffer.clear();
            self.buffer.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buffer.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buffer.drain(..overflow);
        }
        self.buffer.extend(data);
    }

    /// All buffered bytes as a contiguous vector.
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.iter().copied().collect()
    }

    /// The last `n` buffered bytes.
    pub fn tail_bytes(&self, n: usize) -> Vec<u8> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// A terminal's observable output state: the raw ring and the emulator.
///
/// The PTY reader appends to both under one lock so `stdout` requests
/// always observe a byte-aligned, escape-sequence-complete state.
pub struct ScreenState {
    pub emulator: ScreenEmulator,
    pub raw: RawBuffer,
}

impl ScreenState {
    pub fn new(cols: u16, rows: u16, scrollback_lines: usize, raw_capacity: usize) -> Self {
        Self {
            emulator: ScreenEmulator::new(cols, rows, scrollback_lines),
            raw: RawBuffer::new(raw_capacity),
        }
    }

    /// Atomically record a chunk of output in the ring and the emulator.
    pub fn feed(&mut self, data: &[u8]) {
        self.raw.push(data);
        self.emulator.feed(data);
    }
}

/// Notification that a PTY reader has finished (child exited or read error).
pub struct PtyExitEvent {
    pub terminal: String,
    pub exit_code: Option<i32>,
}

/// Spawn the blocking task that drains a terminal's PTY master.
///
/// Exactly one reader runs per terminal. On each wake it appends the chunk
/// to the screen state under its lock, then broadcasts the chunk to
/// subscribers. When the reader sees EOF (or an unrecoverable error) it
/// reaps the child so the exit code is known, then reports on `exit_tx`.
pub fn spawn_pty_reader(
    terminal: String,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    state: Arc<Mutex<ScreenState>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    exit_tx: mpsc::UnboundedSender<PtyExitEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "daemon.pty.reader_eof", terminal = %terminal);
                    break;
                }
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    {
                        let mut guard = match state.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        guard.feed(&data);
                    }
                    // Ignore send errors — no subscribers is fine.
                    let _ = output_tx.send(data);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(
                        event = "daemon.pty.reader_error",
                        terminal = %terminal,
                        error = %e,
                    );
                    break;
                }
            }
        }

        // Reap the child before reporting so the exit code is available
        // when the terminal transitions to exited.
        let exit_code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!(
                    event = "daemon.pty.reap_failed",
                    terminal = %terminal,
                    error = %e,
                );
                None
            }
        };

        let _ = exit_tx.send(PtyExitEvent {
            terminal,
            exit_code,
        });
    })
}
