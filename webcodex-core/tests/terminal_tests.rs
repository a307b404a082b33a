mod common;

use axum::extract::ws::{close_code, Message};
use common::*;
use std::time::Duration;
use webcodex_core::liveness::{Liveness, LivenessMonitor};
use webcodex_core::ws::{unit_testable_terminal_handler, SessionEnd, TerminalOutcome, WsState};

fn spawn_handler(
    state: &WsState,
    out_tx: futures::channel::mpsc::UnboundedSender<Message>,
    in_rx: futures::channel::mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
) -> tokio::task::JoinHandle<TerminalOutcome> {
    let working_directory = state.terminal.data_root.clone();
    tokio::spawn(unit_testable_terminal_handler(
        out_tx,
        in_rx,
        state.clone(),
        working_directory,
    ))
}

async fn finish(handle: tokio::task::JoinHandle<TerminalOutcome>) -> TerminalOutcome {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("handler did not finish")
        .unwrap()
}

#[tokio::test]
async fn test_shell_command_output_is_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "/bin/sh");
    let (out_tx, mut out_rx, in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    // The echoed input shows the expression, only the shell prints the result
    send_text(&in_tx, "echo $((40 + 2))\n");
    let output = wait_for_output(&mut out_rx, "42", 5000).await;
    assert!(output.is_some(), "expected shell output");
    assert_eq!(state.registry.len(), 1);

    in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
    let outcome = finish(handle).await;

    assert_eq!(outcome.end, SessionEnd::ClientClosed);
    assert!(outcome.session_id.is_some());
    assert!(outcome.exit.is_some(), "process should be reaped on close");
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_input_is_written_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "cat");
    let (out_tx, mut out_rx, in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    in_tx
        .unbounded_send(Ok(Message::Binary(bytes::Bytes::from_static(b"one-"))))
        .unwrap();
    send_text(&in_tx, "two-");
    send_text(&in_tx, "three\n");

    let output = wait_for_output(&mut out_rx, "one-two-three", 5000).await;
    assert!(output.is_some(), "expected input in order");

    drop(in_tx);
    let outcome = finish(handle).await;
    assert_eq!(outcome.end, SessionEnd::ClientClosed);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_process_exit_closes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "printf 'all done'; exit 7");
    let (out_tx, mut out_rx, _in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    let (output, frame) = wait_for_close(&mut out_rx, 5000)
        .await
        .expect("expected close frame");
    assert!(output.contains("all done"), "output before close: {output:?}");
    let frame = frame.expect("close frame should carry a code");
    assert_eq!(frame.code, close_code::NORMAL);

    let outcome = finish(handle).await;
    assert_eq!(outcome.end, SessionEnd::ProcessExited);
    let exit = outcome.exit.expect("exit status");
    assert_eq!(exit.code, 7);
    assert!(!exit.success);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_process_starts_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("github/acme/widgets")).unwrap();
    let state = test_state(dir.path(), "pwd");

    let working_directory = state
        .terminal
        .resolve_working_directory(Some("github/acme/widgets"));
    let (out_tx, mut out_rx, _in_tx, in_rx) = create_fake_websocket();
    let handle = tokio::spawn(unit_testable_terminal_handler(
        out_tx,
        in_rx,
        state.clone(),
        working_directory.clone(),
    ));

    let (output, _) = wait_for_close(&mut out_rx, 5000)
        .await
        .expect("expected close frame");
    assert!(
        output.contains(working_directory.to_str().unwrap()),
        "pwd printed {output:?}"
    );
    assert_eq!(finish(handle).await.end, SessionEnd::ProcessExited);
}

#[tokio::test]
async fn test_escaping_directory_runs_in_data_root() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "pwd");
    let root = state.terminal.data_root.clone();

    let working_directory = state.terminal.resolve_working_directory(Some("../../etc"));
    assert_eq!(working_directory, root);

    let (out_tx, mut out_rx, _in_tx, in_rx) = create_fake_websocket();
    let handle = tokio::spawn(unit_testable_terminal_handler(
        out_tx,
        in_rx,
        state.clone(),
        working_directory,
    ));

    let (output, _) = wait_for_close(&mut out_rx, 5000)
        .await
        .expect("expected close frame");
    assert!(output.contains(root.to_str().unwrap()), "pwd printed {output:?}");
    assert!(!output.contains("/etc"));
    finish(handle).await;
}

#[tokio::test]
async fn test_credential_reaches_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), "printf \"key=$OPENAI_API_KEY term=$TERM\"");
    config.openai_api_key = Some("sk-test-123".to_string());
    let state = WsState::new(webcodex_core::ws::TerminalSettings::from_config(&config));

    let (out_tx, mut out_rx, _in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    let (output, _) = wait_for_close(&mut out_rx, 5000)
        .await
        .expect("expected close frame");
    assert!(output.contains("key=sk-test-123"), "output: {output:?}");
    assert!(output.contains("term=xterm-color"), "output: {output:?}");
    finish(handle).await;
}

#[tokio::test]
async fn test_client_close_reaps_process_ignoring_hangup() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "trap '' HUP; echo armed; sleep 30");
    let (out_tx, mut out_rx, in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    assert!(wait_for_output(&mut out_rx, "armed", 5000).await.is_some());

    let started = std::time::Instant::now();
    in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
    let outcome = finish(handle).await;

    assert_eq!(outcome.end, SessionEnd::ClientClosed);
    let exit = outcome.exit.expect("process should be killed after the hangup grace");
    assert!(!exit.success);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_spawn_failure_closes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), "codex");
    config.shell = "/nonexistent/shell".to_string();
    let state = WsState::new(webcodex_core::ws::TerminalSettings::from_config(&config));

    let (out_tx, mut out_rx, _in_tx, in_rx) = create_fake_websocket();
    let outcome = finish(spawn_handler(&state, out_tx, in_rx)).await;

    assert_eq!(outcome.end, SessionEnd::SpawnFailed);
    assert!(outcome.session_id.is_none());
    assert!(outcome.exit.is_none());

    let (_, frame) = wait_for_close(&mut out_rx, 1000)
        .await
        .expect("expected close frame");
    assert_eq!(frame.unwrap().code, close_code::ERROR);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_socket_error_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "sleep 60");
    let (out_tx, _out_rx, in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    assert!(eventually(2000, || state.registry.len() == 1).await);
    in_tx
        .unbounded_send(Err(axum::Error::new(std::io::Error::other("reset"))))
        .unwrap();

    let outcome = finish(handle).await;
    assert_eq!(outcome.end, SessionEnd::ClientClosed);
    let exit = outcome.exit.expect("killed process should be reaped");
    assert!(!exit.success);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_output_after_client_gone_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "while true; do echo tick; sleep 0.05; done");
    let (out_tx, out_rx, in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    // Sends now fail; the relay must keep running until the close arrives
    drop(out_rx);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(state.registry.len(), 1);

    in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
    let outcome = finish(handle).await;
    assert_eq!(outcome.end, SessionEnd::ClientClosed);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_heartbeat_keeps_answering_peer_and_drops_silent_one() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "cat");
    let monitor = LivenessMonitor::new(state.registry.clone(), Duration::from_secs(30));
    let (out_tx, mut out_rx, in_tx, in_rx) = create_fake_websocket();
    let handle = spawn_handler(&state, out_tx, in_rx);

    assert!(eventually(2000, || state.registry.len() == 1).await);
    let session = state.registry.handles().pop().unwrap();

    // First tick pings, the client answers
    assert_eq!(monitor.sweep().pinged, 1);
    assert!(wait_for_ping(&mut out_rx, 2000).await);
    in_tx
        .unbounded_send(Ok(Message::Pong(bytes::Bytes::new())))
        .unwrap();
    assert!(eventually(2000, || session.liveness().get() == Liveness::Alive).await);

    // Second tick pings again since the pong arrived
    let report = monitor.sweep();
    assert_eq!(report.pinged, 1);
    assert_eq!(report.terminated, 0);
    assert!(wait_for_ping(&mut out_rx, 2000).await);

    // No pong this time: the next tick terminates
    let report = monitor.sweep();
    assert_eq!(report.terminated, 1);
    drop(session);

    let outcome = finish(handle).await;
    assert_eq!(outcome.end, SessionEnd::Terminated);
    assert!(outcome.exit.is_some());
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_clear_terminates_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "cat");

    let (out_a, _rx_a, _in_a, in_rx_a) = create_fake_websocket();
    let (out_b, _rx_b, _in_b, in_rx_b) = create_fake_websocket();
    let first = spawn_handler(&state, out_a, in_rx_a);
    let second = spawn_handler(&state, out_b, in_rx_b);

    assert!(eventually(2000, || state.registry.len() == 2).await);
    assert_eq!(state.clear(), 2);

    assert_eq!(finish(first).await.end, SessionEnd::Terminated);
    assert_eq!(finish(second).await.end, SessionEnd::Terminated);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), "cat");

    let (out_a, mut rx_a, in_a, in_rx_a) = create_fake_websocket();
    let (out_b, mut rx_b, in_b, in_rx_b) = create_fake_websocket();
    let first = spawn_handler(&state, out_a, in_rx_a);
    let second = spawn_handler(&state, out_b, in_rx_b);

    send_text(&in_a, "alpha\n");
    send_text(&in_b, "beta\n");
    let a = wait_for_output(&mut rx_a, "alpha", 5000).await.unwrap();
    let b = wait_for_output(&mut rx_b, "beta", 5000).await.unwrap();
    assert!(!a.contains("beta"));
    assert!(!b.contains("alpha"));

    // Closing one leaves the other running
    in_a.unbounded_send(Ok(Message::Close(None))).unwrap();
    assert_eq!(finish(first).await.end, SessionEnd::ClientClosed);
    assert_eq!(state.registry.len(), 1);

    send_text(&in_b, "still here\n");
    assert!(wait_for_output(&mut rx_b, "still here", 5000).await.is_some());

    drop(in_b);
    assert_eq!(finish(second).await.end, SessionEnd::ClientClosed);
    assert!(state.registry.is_empty());
}
