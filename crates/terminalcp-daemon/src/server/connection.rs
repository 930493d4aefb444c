//! Per-connection request handling and event fan-out.
//!
//! Each accepted connection gets a reader task (this module's main loop)
//! and a writer task draining a bounded outbound queue. Responses and
//! events share the queue; event forwarders never block on it — a
//! subscriber whose queue overflows is disconnected so PTY readers and
//! other terminals are unaffected.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::DaemonError;
use crate::keys;
use crate::pty::output::ScreenState;
use crate::terminal::manager::{TerminalManager, stop_terminal};
use crate::terminal::state::ConnectionId;
use terminalcp_protocol::{ErrorCode, Request, ServerMessage, StdoutMode, TermSize, codec};

const KNOWN_ACTIONS: &[&str] = &[
    "start",
    "stop",
    "stdin",
    "stdout",
    "subscribe",
    "unsubscribe",
    "list",
    "resize",
    "term-size",
    "kill-server",
];

/// Handle one client connection for its whole lifetime.
pub async fn handle_connection(
    stream: UnixStream,
    manager: Arc<RwLock<TerminalManager>>,
    shutdown: CancellationToken,
) {
    let (connection, event_queue_len, enter_delay) = {
        let mut mgr = manager.write().await;
        (
            mgr.next_connection_id(),
            mgr.config().event_queue_len,
            Duration::from_millis(mgr.config().enter_delay_ms),
        )
    };

    debug!(event = "daemon.server.connection_accepted", connection = connection);

    let (read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(event_queue_len);
    let conn_token = CancellationToken::new();

    // The writer watches the connection token so a disconnect decision
    // (slow subscriber, internal error) terminates it even while it is
    // blocked writing to a stuck peer. Dropping the receiver unblocks
    // any sender still queueing a response.
    let writer_token = conn_token.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    match maybe {
                        Some(msg) => {
                            if codec::write_message(&mut write_half, &msg).await.is_err() {
                                writer_token.cancel();
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = writer_token.cancelled() => break,
            }
        }
    });

    let mut ctx = ConnectionCtx {
        connection,
        manager: manager.clone(),
        outbound: outbound_tx,
        conn_token: conn_token.clone(),
        shutdown: shutdown.clone(),
        subscriptions: HashMap::new(),
        enter_delay,
    };

    let mut reader = BufReader::new(read_half);
    loop {
        let mut line = String::new();
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        debug!(event = "daemon.server.connection_closed", connection = connection);
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let value: serde_json::Value = match serde_json::from_str(trimmed) {
                            Ok(value) => value,
                            Err(e) => {
                                // Malformed JSON: the framing is gone, close.
                                warn!(
                                    event = "daemon.server.malformed_frame",
                                    connection = connection,
                                    error = %e,
                                );
                                break;
                            }
                        };
                        ctx.handle_frame(value).await;
                    }
                    Err(e) => {
                        warn!(
                            event = "daemon.server.connection_read_error",
                            connection = connection,
                            error = %e,
                        );
                        break;
                    }
                }
            }
            _ = conn_token.cancelled() => break,
            _ = shutdown.cancelled() => break,
        }
    }

    conn_token.cancel();
    for token in ctx.subscriptions.values() {
        token.cancel();
    }
    manager.write().await.detach_connection(connection);
    drop(ctx);
    // Let the writer flush whatever is already queued.
    let _ = writer_task.await;
}

/// Log a failed request and build its error response frame.
///
/// Internal errors are the daemon's own bugs and get full-volume logging;
/// the caller additionally closes the connection for them.
fn error_frame(connection: ConnectionId, id: &str, error: &DaemonError) -> ServerMessage {
    if error.is_user_error() {
        debug!(
            event = "daemon.server.request_rejected",
            connection = connection,
            error = %error,
        );
    } else if error.error_code() == ErrorCode::InternalError {
        error!(
            event = "daemon.server.internal_error",
            connection = connection,
            error = %error,
        );
    } else {
        warn!(
            event = "daemon.server.request_failed",
            connection = connection,
            error = %error,
        );
    }
    ServerMessage::err(id, error.error_code(), error.to_string())
}

struct ConnectionCtx {
    connection: ConnectionId,
    manager: Arc<RwLock<TerminalManager>>,
    outbound: mpsc::Sender<ServerMessage>,
    conn_token: CancellationToken,
    shutdown: CancellationToken,
    subscriptions: HashMap<String, CancellationToken>,
    enter_delay: Duration,
}

impl ConnectionCtx {
    async fn respond(&self, msg: ServerMessage) {
        // A closed queue means the connection is going away; nothing to do.
        let _ = self.outbound.send(msg).await;
    }

    /// Report a failed request. An `InternalError` response closes the
    /// connection after the frame is queued; the daemon stays up.
    async fn respond_failure(&self, id: &str, error: &DaemonError) {
        self.respond(error_frame(self.connection, id, error)).await;
        if error.error_code() == ErrorCode::InternalError {
            self.conn_token.cancel();
        }
    }

    async fn respond_result(&self, id: &str, result: Result<ServerMessage, DaemonError>) {
        match result {
            Ok(msg) => self.respond(msg).await,
            Err(e) => self.respond_failure(id, &e).await,
        }
    }

    /// Parse one frame into a typed request and dispatch it.
    ///
    /// A frame that is valid JSON but not a valid request keeps the
    /// connection: unknown `action` values get `UnknownAction`, shape
    /// errors get `BadRequest`.
    async fn handle_frame(&mut self, value: serde_json::Value) {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match serde_json::from_value::<Request>(value.clone()) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                let action = value
                    .get("action")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if KNOWN_ACTIONS.contains(&action) {
                    self.respond_failure(&id, &DaemonError::BadRequest(e.to_string()))
                        .await;
                } else {
                    self.respond_failure(&id, &DaemonError::UnknownAction(action.to_string()))
                        .await;
                }
            }
        }
    }

    async fn dispatch(&mut self, request: Request) {
        match request {
            Request::Start {
                id,
                command,
                cols,
                rows,
                cwd,
                env,
            } => {
                let env: Vec<(String, String)> =
                    env.map(|m| m.into_iter().collect()).unwrap_or_default();
                let result = self
                    .manager
                    .write()
                    .await
                    .start(&command, cols, rows, cwd, env)
                    .map(|terminal| ServerMessage::ok(&id, serde_json::Value::String(terminal)));
                self.respond_result(&id, result).await;
            }

            Request::Stop {
                id,
                terminal,
                force,
            } => {
                // The grace wait must not stall this connection's other
                // requests; stop runs as its own task.
                let manager = self.manager.clone();
                let outbound = self.outbound.clone();
                let conn_token = self.conn_token.clone();
                let connection = self.connection;
                tokio::spawn(async move {
                    match stop_terminal(&manager, &terminal, force).await {
                        Ok(()) => {
                            let _ = outbound.send(ServerMessage::ok_empty(&id)).await;
                        }
                        Err(e) => {
                            let msg = error_frame(connection, &id, &e);
                            let internal = e.error_code() == ErrorCode::InternalError;
                            let _ = outbound.send(msg).await;
                            if internal {
                                conn_token.cancel();
                            }
                        }
                    }
                });
            }

            Request::Stdin {
                id,
                terminal,
                data,
                is_key,
            } => {
                // The post-Enter delay runs under the input lock; doing it
                // in a task keeps this connection responsive meanwhile.
                let manager = self.manager.clone();
                let outbound = self.outbound.clone();
                let conn_token = self.conn_token.clone();
                let connection = self.connection;
                let enter_delay = self.enter_delay;
                tokio::spawn(async move {
                    match write_stdin(&manager, &terminal, &data, is_key, enter_delay).await {
                        Ok(()) => {
                            let _ = outbound.send(ServerMessage::ok_empty(&id)).await;
                        }
                        Err(e) => {
                            let msg = error_frame(connection, &id, &e);
                            let internal = e.error_code() == ErrorCode::InternalError;
                            let _ = outbound.send(msg).await;
                            if internal {
                                conn_token.cancel();
                            }
                        }
                    }
                });
            }

            Request::Stdout {
                id,
                terminal,
                mode,
                lines,
                bytes,
            } => {
                let result = self
                    .manager
                    .read()
                    .await
                    .screen_handle(&terminal)
                    .map(|screen| {
                        ServerMessage::ok(
                            &id,
                            serde_json::Value::String(read_stdout(&screen, mode, lines, bytes)),
                        )
                    });
                self.respond_result(&id, result).await;
            }

            Request::Subscribe { id, terminal } => {
                let result = self
                    .manager
                    .write()
                    .await
                    .subscribe(&terminal, self.connection);
                match result {
                    Ok(rx) => {
                        let sub_token = CancellationToken::new();
                        if let Some(old) =
                            self.subscriptions.insert(terminal.clone(), sub_token.clone())
                        {
                            // Re-subscribing replaces the old forwarder so the
                            // client never sees duplicate events.
                            old.cancel();
                        }
                        tokio::spawn(forward_output(
                            self.manager.clone(),
                            terminal,
                            rx,
                            self.outbound.clone(),
                            self.conn_token.clone(),
                            sub_token,
                            self.connection,
                        ));
                        self.respond(ServerMessage::ok_empty(&id)).await;
                    }
                    Err(e) => self.respond_failure(&id, &e).await,
                }
            }

            Request::Unsubscribe { id, terminal } => {
                if let Some(token) = self.subscriptions.remove(&terminal) {
                    token.cancel();
                }
                let result = self
                    .manager
                    .write()
                    .await
                    .unsubscribe(&terminal, self.connection)
                    .map(|()| ServerMessage::ok_empty(&id));
                self.respond_result(&id, result).await;
            }

            Request::List { id } => {
                let terminals = self.manager.read().await.list();
                let result = serde_json::to_value(terminals)
                    .map(|value| ServerMessage::ok(&id, value))
                    .map_err(DaemonError::Serde);
                self.respond_result(&id, result).await;
            }

            Request::Resize {
                id,
                terminal,
                cols,
                rows,
            } => {
                let result = self
                    .manager
                    .write()
                    .await
                    .resize(&terminal, cols, rows)
                    .map(|()| ServerMessage::ok_empty(&id));
                self.respond_result(&id, result).await;
            }

            Request::TermSize { id } => {
                let result = serde_json::to_value(daemon_term_size())
                    .map(|value| ServerMessage::ok(&id, value))
                    .map_err(DaemonError::Serde);
                self.respond_result(&id, result).await;
            }

            Request::KillServer { id } => {
                self.respond(ServerMessage::ok_empty(&id)).await;
                // Give the writer a chance to flush the ack before the
                // server starts tearing down.
                tokio::task::yield_now().await;
                self.shutdown.cancel();
            }
        }
    }
}

/// Translate (if requested) and write stdin bytes under the input lock.
async fn write_stdin(
    manager: &Arc<RwLock<TerminalManager>>,
    terminal: &str,
    data: &str,
    is_key: bool,
    enter_delay: Duration,
) -> Result<(), DaemonError> {
    let bytes = if is_key {
        keys::key_to_bytes(data)?
    } else {
        data.as_bytes().to_vec()
    };

    let writer = manager.read().await.writer_handle(terminal)?;
    let mut guard = writer.lock().await;
    guard
        .write_all(&bytes)
        .map_err(|e| DaemonError::WriteError(e.to_string()))?;
    guard
        .flush()
        .map_err(|e| DaemonError::WriteError(e.to_string()))?;

    if bytes.contains(&b'\r') {
        // Line-buffered children miss rapid successive inputs; the pause
        // after Enter is part of the stdin contract. It runs under the
        // input lock so concurrent writers inherit the cadence.
        tokio::time::sleep(enter_delay).await;
    }
    Ok(())
}

/// Assemble a `stdout` response from the screen state.
///
/// Stream reads: `bytes` wins over `lines`; `lines` splits the raw stream
/// at newlines only (carriage returns from redraws stay inside a line).
fn read_stdout(
    screen: &Arc<std::sync::Mutex<ScreenState>>,
    mode: StdoutMode,
    lines: Option<usize>,
    bytes: Option<usize>,
) -> String {
    let guard = match screen.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match mode {
        StdoutMode::Screen => guard.emulator.snapshot(),
        StdoutMode::Stream => {
            let raw = if let Some(n) = bytes {
                guard.raw.tail_bytes(n)
            } else {
                guard.raw.contents()
            };
            drop(guard);
            let text = String::from_utf8_lossy(&raw).into_owned();
            match (bytes, lines) {
                (None, Some(n)) => {
                    let parts: Vec<&str> = text.split('\n').collect();
                    let start = parts.len().saturating_sub(n);
                    parts[start..].join("\n")
                }
                _ => text,
            }
        }
    }
}

/// Length of an incomplete UTF-8 sequence at the end of `buf`, 0 if the
/// buffer ends on a complete (or undecodably invalid) boundary. Only the
/// last three bytes can belong to an unfinished sequence.
fn incomplete_tail_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let byte = buf[i];
        if byte < 0x80 {
            return 0;
        }
        if byte >= 0xC0 {
            let need = if byte >= 0xF0 {
                4
            } else if byte >= 0xE0 {
                3
            } else {
                2
            };
            return if len - i < need { len - i } else { 0 };
        }
        // Continuation byte, keep scanning backwards.
    }
    0
}

/// Incrementally decode a raw output chunk for the event stream.
///
/// PTY reads can split a multi-byte character across chunk boundaries;
/// decoding each chunk in isolation would emit replacement characters
/// that a whole-buffer `stdout` stream read of the same bytes would not,
/// breaking the prefix equality between the two views. The carry holds a
/// trailing incomplete sequence until the next chunk completes it.
fn decode_stream_chunk(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    let ready = carry.len() - incomplete_tail_len(carry);
    let text = String::from_utf8_lossy(&carry[..ready]).into_owned();
    carry.drain(..ready);
    text
}

/// Forward one terminal's output chunks to one connection as events.
///
/// Never blocks: a full outbound queue (or a lagged broadcast receiver)
/// breaks the per-subscriber ordering contract, so the whole connection is
/// dropped instead of stalling or skipping.
async fn forward_output(
    manager: Arc<RwLock<TerminalManager>>,
    terminal: String,
    mut rx: broadcast::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<ServerMessage>,
    conn_token: CancellationToken,
    sub_token: CancellationToken,
    connection: ConnectionId,
) {
    let mut carry: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,
            _ = sub_token.cancelled() => break,
            received = rx.recv() => match received {
                Ok(chunk) => {
                    let text = decode_stream_chunk(&mut carry, &chunk);
                    if text.is_empty() {
                        // Whole chunk held back as a partial sequence.
                        continue;
                    }
                    let msg = ServerMessage::output_event(&terminal, text);
                    match outbound.try_send(msg) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                event = "daemon.server.slow_subscriber_dropped",
                                terminal = %terminal,
                                connection = connection,
                            );
                            conn_token.cancel();
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Flush any held partial sequence so the event stream
                    // covers the terminal's full output prefix.
                    if !carry.is_empty() {
                        let text = String::from_utf8_lossy(&carry).into_owned();
                        carry.clear();
                        let _ = outbound.try_send(ServerMessage::output_event(&terminal, text));
                    }
                    // Terminal exited: tell the subscriber, with the exit
                    // code when the reaper already recorded it.
                    let exit_code = manager.read().await.exit_code(&terminal);
                    let _ = outbound
                        .try_send(ServerMessage::exit_event(&terminal, exit_code));
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        event = "daemon.server.subscriber_lagged",
                        terminal = %terminal,
                        connection = connection,
                        missed = missed,
                    );
                    conn_token.cancel();
                    break;
                }
            }
        }
    }
}

fn daemon_term_size() -> TermSize {
    match terminal_size::terminal_size() {
        Some((width, height)) => TermSize {
            cols: width.0,
            rows: height.0,
        },
        None => TermSize { cols: 80, rows: 24 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::output::ScreenState;
    use crate::types::DaemonConfig;
    use std::sync::Mutex as StdMutex;
    use terminalcp_protocol::EventKind;

    fn screen_with(data: &[u8]) -> Arc<StdMutex<ScreenState>> {
        let mut state = ScreenState::new(80, 24, 100, 4096);
        state.feed(data);
        Arc::new(StdMutex::new(state))
    }

    #[test]
    fn test_read_stdout_screen() {
        let screen = screen_with(b"hello world");
        let text = read_stdout(&screen, StdoutMode::Screen, None, None);
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_read_stdout_stream_full() {
        let screen = screen_with(b"line1\nline2\nline3");
        let text = read_stdout(&screen, StdoutMode::Stream, None, None);
        assert_eq!(text, "line1\nline2\nline3");
    }

    #[test]
    fn test_read_stdout_stream_last_lines() {
        let screen = screen_with(b"line1\nline2\nline3");
        let text = read_stdout(&screen, StdoutMode::Stream, Some(2), None);
        assert_eq!(text, "line2\nline3");
    }

    #[test]
    fn test_read_stdout_stream_last_bytes() {
        let screen = screen_with(b"0123456789");
        let text = read_stdout(&screen, StdoutMode::Stream, None, Some(4));
        assert_eq!(text, "6789");
    }

    #[test]
    fn test_read_stdout_stream_bytes_wins_over_lines() {
        let screen = screen_with(b"line1\nline2\nline3");
        let text = read_stdout(&screen, StdoutMode::Stream, Some(1), Some(5));
        assert_eq!(text, "line3");
    }

    #[test]
    fn test_read_stdout_stream_carriage_returns_stay_in_line() {
        // Interactive redraws produce \r without \n; a line count must not
        // split on them.
        let screen = screen_with(b"progress 10%\rprogress 50%\rdone\nnext");
        let text = read_stdout(&screen, StdoutMode::Stream, Some(2), None);
        assert_eq!(text, "progress 10%\rprogress 50%\rdone\nnext");
    }

    #[test]
    fn test_read_stdout_stream_invalid_utf8_replaced() {
        let screen = screen_with(b"ok \xff\xfe bytes");
        let text = read_stdout(&screen, StdoutMode::Stream, None, None);
        assert!(text.contains("ok"));
        assert!(text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_incomplete_tail_len() {
        assert_eq!(incomplete_tail_len(b""), 0);
        assert_eq!(incomplete_tail_len(b"ascii"), 0);
        // Complete two-byte character.
        assert_eq!(incomplete_tail_len("é".as_bytes()), 0);
        // Lone leading bytes of 2/3/4-byte sequences.
        assert_eq!(incomplete_tail_len(b"a\xc3"), 1);
        assert_eq!(incomplete_tail_len(b"a\xe2\x82"), 2);
        assert_eq!(incomplete_tail_len(b"a\xf0\x9f\xa6"), 3);
        // Complete four-byte character (leading byte outside the window).
        assert_eq!(incomplete_tail_len("🦀".as_bytes()), 0);
        // Stray continuation bytes are undecodable, not incomplete.
        assert_eq!(incomplete_tail_len(b"\x80\x80\x80\x80"), 0);
    }

    #[test]
    fn test_decode_stream_chunk_ascii() {
        let mut carry = Vec::new();
        assert_eq!(decode_stream_chunk(&mut carry, b"hello"), "hello");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_stream_chunk_rejoins_split_two_byte() {
        let mut carry = Vec::new();
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte é.
        let first = decode_stream_chunk(&mut carry, &bytes[..2]);
        assert_eq!(first, "h");
        assert_eq!(carry.len(), 1);
        let second = decode_stream_chunk(&mut carry, &bytes[2..]);
        assert_eq!(second, "éllo");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_stream_chunk_rejoins_split_four_byte() {
        let mut carry = Vec::new();
        let bytes = "🦀".as_bytes();
        assert_eq!(decode_stream_chunk(&mut carry, &bytes[..2]), "");
        assert_eq!(carry.len(), 2);
        assert_eq!(decode_stream_chunk(&mut carry, &bytes[2..]), "🦀");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_stream_chunk_invalid_bytes_replaced() {
        let mut carry = Vec::new();
        let text = decode_stream_chunk(&mut carry, b"ok \x80\x81 done");
        assert!(text.contains("ok"));
        assert!(text.contains('\u{FFFD}'));
        assert!(carry.is_empty());
    }

    #[tokio::test]
    async fn test_forward_output_rejoins_split_characters() {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(RwLock::new(TerminalManager::new(
            DaemonConfig::default(),
            exit_tx,
        )));
        let (chunk_tx, chunk_rx) = broadcast::channel(16);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let conn_token = CancellationToken::new();
        let sub_token = CancellationToken::new();

        let task = tokio::spawn(forward_output(
            manager,
            "t1".to_string(),
            chunk_rx,
            outbound_tx,
            conn_token,
            sub_token,
            1,
        ));

        let bytes = "héllo".as_bytes();
        chunk_tx.send(bytes[..2].to_vec()).unwrap();
        chunk_tx.send(bytes[2..].to_vec()).unwrap();
        drop(chunk_tx);

        let mut collected = String::new();
        let mut saw_exit = false;
        while let Some(msg) = outbound_rx.recv().await {
            match msg {
                ServerMessage::Event {
                    kind: EventKind::Output,
                    data,
                    ..
                } => collected.push_str(&data),
                ServerMessage::Event {
                    kind: EventKind::Exit,
                    ..
                } => saw_exit = true,
                _ => {}
            }
        }
        task.await.unwrap();

        assert_eq!(collected, "héllo");
        assert!(!collected.contains('\u{FFFD}'));
        assert!(saw_exit, "exit event should follow channel closure");
    }

    #[tokio::test]
    async fn test_forward_output_flushes_carry_on_exit() {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(RwLock::new(TerminalManager::new(
            DaemonConfig::default(),
            exit_tx,
        )));
        let (chunk_tx, chunk_rx) = broadcast::channel(16);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);

        let task = tokio::spawn(forward_output(
            manager,
            "t1".to_string(),
            chunk_rx,
            outbound_tx,
            CancellationToken::new(),
            CancellationToken::new(),
            1,
        ));

        // A chunk ending mid-character, then the channel closes: the held
        // bytes must still reach the subscriber (as replacements).
        let bytes = "a🦀".as_bytes();
        chunk_tx.send(bytes[..3].to_vec()).unwrap();
        drop(chunk_tx);

        let mut collected = String::new();
        while let Some(msg) = outbound_rx.recv().await {
            if let ServerMessage::Event {
                kind: EventKind::Output,
                data,
                ..
            } = msg
            {
                collected.push_str(&data);
            }
        }
        task.await.unwrap();

        assert!(collected.starts_with('a'));
        assert!(collected.contains('\u{FFFD}'));
    }

    #[test]
    fn test_daemon_term_size_has_sane_defaults() {
        let size = daemon_term_size();
        assert!(size.cols > 0);
        assert!(size.rows > 0);
    }

    #[test]
    fn test_known_actions_cover_wire_protocol() {
        for action in [
            "start",
            "stop",
            "stdin",
            "stdout",
            "subscribe",
            "unsubscribe",
            "list",
            "resize",
            "term-size",
            "kill-server",
        ] {
            assert!(KNOWN_ACTIONS.contains(&action));
        }
    }
}
