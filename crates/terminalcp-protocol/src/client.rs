//! Async JSONL IPC client for the terminalcp daemon.
//!
//! A [`Client`] owns one Unix-socket connection. Requests are assigned
//! monotonically increasing ids and correlated to responses by id; streamed
//! events are routed to a channel the caller drains via [`Client::take_events`].
//! Each request carries a timeout (default 5 s) that completes the pending
//! request with [`ClientError::Timeout`] without closing the connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

use crate::codec;
use crate::messages::{
    ErrorBody, ErrorCode, EventKind, Request, ServerMessage, StdoutMode, TermSize, TerminalInfo,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error from the IPC client layer.
#[non_exhaustive]
#[derive(Debug)]
pub enum ClientError {
    /// Daemon socket does not exist or connection was refused.
    NotRunning { path: String },
    /// Socket exists but connection failed for a non-`ConnectionRefused` reason.
    ConnectionFailed(std::io::Error),
    /// Daemon returned an explicit error response.
    Daemon { code: ErrorCode, message: String },
    /// Protocol-level error (serialization, unexpected payload shape).
    Protocol { message: String },
    /// The request timed out waiting for a response.
    Timeout,
    /// The connection dropped while the request was in flight.
    Disconnected,
    /// Auto-starting the daemon failed.
    AutoStart { message: String },
    /// Other I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotRunning { path } => {
                write!(f, "daemon is not running (socket not found at {})", path)
            }
            ClientError::ConnectionFailed(e) => write!(f, "connection failed: {}", e),
            ClientError::Daemon { code, message } => {
                write!(f, "daemon error [{}]: {}", code, message)
            }
            ClientError::Protocol { message } => write!(f, "protocol error: {}", message),
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::Disconnected => write!(f, "connection to daemon lost"),
            ClientError::AutoStart { message } => write!(f, "daemon auto-start failed: {}", message),
            ClientError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::ConnectionFailed(e) | ClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// A streamed terminal event delivered outside the request/response flow.
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub terminal: String,
    pub kind: EventKind,
    pub data: String,
}

/// Body of a correlated response, handed from the reader task to the waiter.
struct ResponseBody {
    ok: bool,
    result: Option<serde_json::Value>,
    error: Option<ErrorBody>,
}

/// Pending requests keyed by id. `None` once the connection has dropped,
/// so new requests fail fast with `Disconnected`.
type PendingMap = Arc<StdMutex<Option<HashMap<String, oneshot::Sender<ResponseBody>>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, Option<HashMap<String, oneshot::Sender<ResponseBody>>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Async connection to the terminalcp daemon.
pub struct Client {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
    events: Option<mpsc::UnboundedReceiver<TerminalEvent>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Connect to the daemon at `socket_path`.
    ///
    /// Returns `NotRunning` if the socket does not exist or the connection
    /// is refused (stale socket).
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        if !socket_path.exists() {
            return Err(ClientError::NotRunning {
                path: socket_path.display().to_string(),
            });
        }

        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ClientError::NotRunning {
                    path: socket_path.display().to_string(),
                }
            } else {
                ClientError::ConnectionFailed(e)
            }
        })?;

        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(StdMutex::new(Some(HashMap::new())));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match codec::read_message::<_, ServerMessage>(&mut reader).await {
                    Ok(Some(ServerMessage::Response {
                        id,
                        ok,
                        result,
                        error,
                    })) => {
                        let waiter = lock_pending(&reader_pending)
                            .as_mut()
                            .and_then(|map| map.remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(ResponseBody { ok, result, error });
                            }
                            None => {
                                // Waiter timed out or never existed.
                                debug!(event = "client.response_unmatched", id = %id);
                            }
                        }
                    }
                    Ok(Some(ServerMessage::Event {
                        terminal,
                        kind,
                        data,
                    })) => {
                        let _ = events_tx.send(TerminalEvent {
                            terminal,
                            kind,
                            data,
                        });
                    }
                    Ok(None) => {
                        debug!(event = "client.connection_closed");
                        break;
                    }
                    Err(e) => {
                        debug!(event = "client.read_error", error = %e);
                        break;
                    }
                }
            }
            // Fail all in-flight requests with Disconnected by dropping
            // their senders, and reject future requests.
            *lock_pending(&reader_pending) = None;
        });

        Ok(Self {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            next_id: AtomicU64::new(1),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            events: Some(events_rx),
            reader_task,
        })
    }

    /// Connect, auto-starting the daemon if the socket is absent or stale.
    pub async fn connect_or_spawn(socket_path: &Path) -> Result<Self, ClientError> {
        match Self::connect(socket_path).await {
            Ok(client) => Ok(client),
            Err(ClientError::NotRunning { .. }) | Err(ClientError::ConnectionFailed(_)) => {
                crate::autostart::ensure_daemon_running(socket_path).await?;
                Self::connect(socket_path).await
            }
            Err(e) => Err(e),
        }
    }

    /// Override the per-request timeout (default 5 s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take the event receiver. Events for subscribed terminals arrive here;
    /// can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TerminalEvent>> {
        self.events.take()
    }

    fn fresh_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Send one request and await its correlated response.
    async fn request(&self, req: Request) -> Result<serde_json::Value, ClientError> {
        let id = req.id().to_string();
        let (tx, rx) = oneshot::channel();

        match lock_pending(&self.pending).as_mut() {
            Some(map) => {
                map.insert(id.clone(), tx);
            }
            None => return Err(ClientError::Disconnected),
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = codec::write_message(&mut *writer, &req).await {
                lock_pending(&self.pending)
                    .as_mut()
                    .and_then(|map| map.remove(&id));
                return Err(match e {
                    codec::CodecError::Io(io) => ClientError::Io(io),
                    codec::CodecError::Malformed(message) => ClientError::Protocol { message },
                });
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_elapsed) => {
                // Expiry completes the pending request without closing the
                // connection; a late response is dropped as unmatched.
                lock_pending(&self.pending)
                    .as_mut()
                    .and_then(|map| map.remove(&id));
                Err(ClientError::Timeout)
            }
            Ok(Err(_closed)) => Err(ClientError::Disconnected),
            Ok(Ok(body)) => {
                if body.ok {
                    Ok(body.result.unwrap_or(serde_json::Value::Null))
                } else {
                    let error = body.error.unwrap_or(ErrorBody {
                        code: ErrorCode::InternalError,
                        message: "error response without error body".to_string(),
                    });
                    Err(ClientError::Daemon {
                        code: error.code,
                        message: error.message,
                    })
                }
            }
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(
        value: serde_json::Value,
    ) -> Result<T, ClientError> {
        serde_json::from_value(value).map_err(|e| ClientError::Protocol {
            message: format!("unexpected result shape: {}", e),
        })
    }

    // --- Typed operations ---

    /// Spawn a command in a new terminal; returns the assigned terminal id.
    pub async fn start(
        &self,
        command: &str,
        cols: Option<u16>,
        rows: Option<u16>,
        cwd: Option<String>,
        env: Option<HashMap<String, String>>,
    ) -> Result<String, ClientError> {
        let value = self
            .request(Request::Start {
                id: self.fresh_id(),
                command: command.to_string(),
                cols,
                rows,
                cwd,
                env,
            })
            .await?;
        Self::decode(value)
    }

    /// Stop a terminal, waiting for it to be reaped.
    pub async fn stop(&self, terminal: &str, force: bool) -> Result<(), ClientError> {
        self.request(Request::Stop {
            id: self.fresh_id(),
            terminal: terminal.to_string(),
            force,
        })
        .await?;
        Ok(())
    }

    /// Write raw text to a terminal's stdin.
    pub async fn stdin(&self, terminal: &str, data: &str) -> Result<(), ClientError> {
        self.request(Request::Stdin {
            id: self.fresh_id(),
            terminal: terminal.to_string(),
            data: data.to_string(),
            is_key: false,
        })
        .await?;
        Ok(())
    }

    /// Send a symbolic key token (e.g. `Up`, `C-c`) to a terminal.
    pub async fn stdin_key(&self, terminal: &str, token: &str) -> Result<(), ClientError> {
        self.request(Request::Stdin {
            id: self.fresh_id(),
            terminal: terminal.to_string(),
            data: token.to_string(),
            is_key: true,
        })
        .await?;
        Ok(())
    }

    /// Read the rendered screen snapshot.
    pub async fn stdout_screen(&self, terminal: &str) -> Result<String, ClientError> {
        let value = self
            .request(Request::Stdout {
                id: self.fresh_id(),
                terminal: terminal.to_string(),
                mode: StdoutMode::Screen,
                lines: None,
                bytes: None,
            })
            .await?;
        Self::decode(value)
    }

    /// Read the raw output stream (optionally the last `lines` or `bytes`).
    pub async fn stdout_stream(
        &self,
        terminal: &str,
        lines: Option<usize>,
        bytes: Option<usize>,
    ) -> Result<String, ClientError> {
        let value = self
            .request(Request::Stdout {
                id: self.fresh_id(),
                terminal: terminal.to_string(),
                mode: StdoutMode::Stream,
                lines,
                bytes,
            })
            .await?;
        Self::decode(value)
    }

    /// Subscribe this connection to a terminal's output events.
    pub async fn subscribe(&self, terminal: &str) -> Result<(), ClientError> {
        self.request(Request::Subscribe {
            id: self.fresh_id(),
            terminal: terminal.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Remove this connection's subscription to a terminal.
    pub async fn unsubscribe(&self, terminal: &str) -> Result<(), ClientError> {
        self.request(Request::Unsubscribe {
            id: self.fresh_id(),
            terminal: terminal.to_string(),
        })
        .await?;
        Ok(())
    }

    /// List all known terminals in creation order.
    pub async fn list(&self) -> Result<Vec<TerminalInfo>, ClientError> {
        let value = self
            .request(Request::List {
                id: self.fresh_id(),
            })
            .await?;
        Self::decode(value)
    }

    /// Resize a terminal.
    pub async fn resize(&self, terminal: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.request(Request::Resize {
            id: self.fresh_id(),
            terminal: terminal.to_string(),
            cols,
            rows,
        })
        .await?;
        Ok(())
    }

    /// Dimensions of the daemon's controlling terminal.
    pub async fn term_size(&self) -> Result<TermSize, ClientError> {
        let value = self
            .request(Request::TermSize {
                id: self.fresh_id(),
            })
            .await?;
        Self::decode(value)
    }

    /// Ask the daemon to shut down gracefully.
    ///
    /// The daemon may close the connection right after (or instead of)
    /// acknowledging; a disconnect here counts as success.
    pub async fn kill_server(&self) -> Result<(), ClientError> {
        match self
            .request(Request::KillServer {
                id: self.fresh_id(),
            })
            .await
        {
            Ok(_) | Err(ClientError::Disconnected) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Locate the daemon binary: prefer a sibling of the current executable,
/// fall back to `$PATH` resolution by name.
pub(crate) fn daemon_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("terminalcp-daemon");
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from("terminalcp-daemon")
}
