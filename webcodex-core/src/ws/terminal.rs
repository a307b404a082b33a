//! Interactive terminal over a raw WebSocket.
//!
//! `GET /ws/terminal?workingDirectory=<path>` upgrades to a WebSocket and
//! spawns one PTY process rooted at the resolved directory. There is no
//! envelope: every text or binary frame from the client is keyboard input,
//! every text frame from the server is terminal output.
//!
//! The connection ends on whichever happens first:
//! - the client closes (or the socket errors): the process is hung up, then
//!   killed if it is still running after a grace period
//! - the process exits: remaining output is flushed and a close frame sent
//! - the liveness monitor gives up on the peer: the socket is dropped
//!
//! The PTY is never resized; it keeps its initial geometry for its lifetime.

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::WsState;
use crate::process::{ProcessExit, ProcessOutput, ProcessSession, HANGUP_GRACE};
use crate::registry::{SessionCommand, SessionId};

/// How long trailing output is still relayed after the process exits.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How long teardown waits for the exit once SIGKILL has been sent.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
pub struct TerminalParams {
    #[serde(rename = "workingDirectory", alias = "repoPath")]
    pub working_directory: Option<String>,
}

/// Why a terminal session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The process could not be started; the socket was closed.
    SpawnFailed,
    /// The client closed the socket or it broke.
    ClientClosed,
    /// The process exited on its own.
    ProcessExited,
    /// The liveness monitor (or shutdown) terminated the session.
    Terminated,
}

#[derive(Debug, Clone, Copy)]
pub struct TerminalOutcome {
    pub session_id: Option<SessionId>,
    pub end: SessionEnd,
    /// Exit of the child, if observed before the handler returned.
    pub exit: Option<ProcessExit>,
}

/// WebSocket upgrade handler for terminal connections
pub async fn terminal_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<TerminalParams>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    let working_directory = state
        .terminal
        .resolve_working_directory(params.working_directory.as_deref());
    ws.on_upgrade(move |socket| handle_terminal_socket(socket, state, working_directory))
}

async fn handle_terminal_socket(socket: WebSocket, state: WsState, working_directory: PathBuf) {
    let (ws_sender, ws_receiver) = socket.split();
    let outcome =
        unit_testable_terminal_handler(ws_sender, ws_receiver, state, working_directory).await;
    debug!("Terminal WebSocket finished: {:?}", outcome);
}

/// Relay one terminal session between the given socket halves and a freshly
/// spawned process rooted at `working_directory` (already resolved).
pub async fn unit_testable_terminal_handler<W, R>(
    mut ws_sender: W,
    mut ws_receiver: R,
    state: WsState,
    working_directory: PathBuf,
) -> TerminalOutcome
where
    W: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let spec = state.terminal.spawn_spec(&working_directory);
    let (session, mut output) = match ProcessSession::spawn(&spec) {
        Ok(pair) => pair,
        Err(e) => {
            error!(cwd = %working_directory.display(), "Failed to start terminal: {}", e);
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "failed to start terminal".into(),
                })))
                .await;
            return TerminalOutcome {
                session_id: None,
                end: SessionEnd::SpawnFailed,
                exit: None,
            };
        }
    };

    let (registration, mut commands) = state.registry.register(working_directory.clone());
    let session_id = registration.id();
    info!(
        session_id = %session_id,
        pid = ?session.pid(),
        cwd = %working_directory.display(),
        "Terminal session started"
    );

    let mut relay = OutputRelay::default();
    let mut output_done = false;

    let end = loop {
        tokio::select! {
            // Process output -> client
            chunk = output.recv(), if !output_done => {
                match chunk {
                    Some(bytes) => relay.forward(&mut ws_sender, &bytes, session_id).await,
                    // EOF: the exit branch finishes the session
                    None => output_done = true,
                }
            }

            exit = session.exited() => {
                if !output_done {
                    drain_output(&mut output, &mut relay, &mut ws_sender, session_id).await;
                }
                relay.flush(&mut ws_sender, session_id).await;
                info!(session_id = %session_id, code = exit.code, "Terminal process exited");
                break SessionEnd::ProcessExited;
            }

            // Client -> process input
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        write_input(&session, Bytes::copy_from_slice(text.as_str().as_bytes()), session_id);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        write_input(&session, data, session_id);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        registration.handle().liveness().on_pong();
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Axum answers pings automatically
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %session_id, "Terminal client closed");
                        break SessionEnd::ClientClosed;
                    }
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, "Terminal WebSocket error: {}", e);
                        break SessionEnd::ClientClosed;
                    }
                }
            }

            Some(command) = commands.recv() => {
                match command {
                    SessionCommand::Ping => {
                        if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                            // Left awaiting a pong; the next sweep reclaims it
                            debug!(session_id = %session_id, "Heartbeat ping failed");
                        }
                    }
                    SessionCommand::Terminate => break SessionEnd::Terminated,
                }
            }
        }
    };

    let exit = match end {
        SessionEnd::ProcessExited => {
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "process exited".into(),
                })))
                .await;
            session.exit_status()
        }
        _ => {
            let teardown = session.terminate(HANGUP_GRACE);
            let exit = tokio::time::timeout(HANGUP_GRACE + KILL_GRACE, teardown)
                .await
                .ok();
            if exit.is_none() {
                warn!(
                    session_id = %session_id,
                    pid = ?session.pid(),
                    "Terminal process not reaped after SIGKILL"
                );
            }
            exit
        }
    };

    drop(registration);
    info!(session_id = %session_id, end = ?end, "Terminal session closed");

    TerminalOutcome {
        session_id: Some(session_id),
        end,
        exit,
    }
}

fn write_input(session: &ProcessSession, data: Bytes, session_id: SessionId) {
    if let Err(e) = session.write(data) {
        debug!(session_id = %session_id, "Dropped terminal input: {}", e);
    }
}

async fn drain_output<W>(
    output: &mut ProcessOutput,
    relay: &mut OutputRelay,
    ws_sender: &mut W,
    session_id: SessionId,
) where
    W: Sink<Message> + Unpin,
{
    let drain = async {
        while let Some(bytes) = output.recv().await {
            relay.forward(ws_sender, &bytes, session_id).await;
        }
    };
    if tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(session_id = %session_id, "PTY still open after exit, dropping remaining output");
    }
}

/// Sends output chunks as text frames while the socket accepts them.
#[derive(Default)]
struct OutputRelay {
    decoder: Utf8Carry,
    closed: bool,
}

impl OutputRelay {
    async fn forward<W>(&mut self, ws_sender: &mut W, bytes: &[u8], session_id: SessionId)
    where
        W: Sink<Message> + Unpin,
    {
        let text = self.decoder.push(bytes);
        self.send(ws_sender, text, session_id).await;
    }

    async fn flush<W>(&mut self, ws_sender: &mut W, session_id: SessionId)
    where
        W: Sink<Message> + Unpin,
    {
        let text = self.decoder.finish();
        self.send(ws_sender, text, session_id).await;
    }

    async fn send<W>(&mut self, ws_sender: &mut W, text: String, session_id: SessionId)
    where
        W: Sink<Message> + Unpin,
    {
        // Output produced while the socket is not open is dropped
        if self.closed || text.is_empty() {
            return;
        }
        if ws_sender.send(Message::Text(text.into())).await.is_err() {
            debug!(session_id = %session_id, "Terminal socket no longer open, dropping output");
            self.closed = true;
        }
    }
}

/// Decodes a byte stream into UTF-8 text, carrying an incomplete trailing
/// sequence over to the next chunk. Invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
