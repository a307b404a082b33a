use axum::extract::ws::{CloseFrame, Message};
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use webcodex_core::ws::{TerminalSettings, WsState};
use webcodex_core::Config;

/// Creates fake WebSocket streams for testing.
///
/// Returns (out_tx, out_rx, in_tx, in_rx):
/// - `out_tx` / `in_rx` go to `unit_testable_terminal_handler` as ws_sender / ws_receiver
/// - `in_tx` / `out_rx` are used by the test to send/receive frames
#[allow(dead_code)]
pub fn create_fake_websocket() -> (
    futures_mpsc::UnboundedSender<Message>,
    futures_mpsc::UnboundedReceiver<Message>,
    futures_mpsc::UnboundedSender<Result<Message, axum::Error>>,
    futures_mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
) {
    let (out_tx, out_rx) = futures_mpsc::unbounded();
    let (in_tx, in_rx) = futures_mpsc::unbounded();
    (out_tx, out_rx, in_tx, in_rx)
}

/// Terminal state rooted at `root` that runs `command` through `/bin/sh -lc`.
#[allow(dead_code)]
pub fn test_state(root: &Path, command: &str) -> WsState {
    WsState::new(TerminalSettings::from_config(&test_config(root, command)))
}

#[allow(dead_code)]
pub fn test_config(root: &Path, command: &str) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: root.to_path_buf(),
        shell: "/bin/sh".to_string(),
        codex_cmd: command.to_string(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn send_text(tx: &futures_mpsc::UnboundedSender<Result<Message, axum::Error>>, text: &str) {
    tx.unbounded_send(Ok(Message::Text(text.into()))).unwrap();
}

/// Read text frames until the accumulated output contains `needle`.
///
/// Returns the accumulated output, or `None` on timeout or when the socket
/// is closed first.
#[allow(dead_code)]
pub async fn wait_for_output(
    rx: &mut futures_mpsc::UnboundedReceiver<Message>,
    needle: &str,
    timeout_ms: u64,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut output = String::new();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }

        match tokio::time::timeout(remaining, rx.next()).await {
            Ok(Some(Message::Text(text))) => {
                output.push_str(text.as_str());
                if output.contains(needle) {
                    return Some(output);
                }
            }
            Ok(Some(Message::Close(_))) | Ok(None) | Err(_) => return None,
            Ok(Some(_)) => continue,
        }
    }
}

/// Read until a close frame arrives, returning it with all text seen before.
#[allow(dead_code)]
pub async fn wait_for_close(
    rx: &mut futures_mpsc::UnboundedReceiver<Message>,
    timeout_ms: u64,
) -> Option<(String, Option<CloseFrame>)> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut output = String::new();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }

        match tokio::time::timeout(remaining, rx.next()).await {
            Ok(Some(Message::Text(text))) => output.push_str(text.as_str()),
            Ok(Some(Message::Close(frame))) => return Some((output, frame)),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Wait until a heartbeat ping frame is sent to the client.
#[allow(dead_code)]
pub async fn wait_for_ping(
    rx: &mut futures_mpsc::UnboundedReceiver<Message>,
    timeout_ms: u64,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }

        match tokio::time::timeout(remaining, rx.next()).await {
            Ok(Some(Message::Ping(_))) => return true,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return false,
        }
    }
}

/// Poll `condition` every 10ms until it holds or the timeout passes.
#[allow(dead_code)]
pub async fn eventually<F>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
