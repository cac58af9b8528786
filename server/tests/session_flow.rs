//! End-to-end flows through the fan-out layer with real sessions: a new
//! subscriber always observes the scrollback snapshot followed by the live
//! stream, and a full shell round trip reaches subscribers and disk.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use claudex_core::SessionManager;
use claudex_core::Status;
use claudex_server::AppState;
use claudex_server::ServerMessage;
use claudex_server::TerminalSize;
use claudex_server::ws;
use tokio::sync::mpsc;

fn decoded_output(msg: &ServerMessage) -> Option<Vec<u8>> {
    match msg {
        ServerMessage::Output { data, .. } => Some(BASE64.decode(data).unwrap()),
        ServerMessage::Status { .. } => None,
    }
}

#[tokio::test]
async fn subscriber_sees_snapshot_then_live_stream_without_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(SessionManager::new(dir.path()));
    let state = AppState::new(Arc::clone(&manager));

    let session = manager.create("replay", "/tmp").unwrap();
    session
        .ensure_main_pane()
        .unwrap()
        .hydrate_scrollback(b"PRE".to_vec());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = state.broadcaster.register(tx);
    ws::subscribe_and_replay(&state, conn, &session.id);

    state.broadcaster.broadcast_output(&session.id, b"X");
    state.broadcaster.broadcast_output(&session.id, b"Y");

    let mut observed = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Some(bytes) = decoded_output(&msg) {
            observed.extend_from_slice(&bytes);
        }
    }
    assert_eq!(observed, b"PREXY");
}

#[tokio::test]
async fn second_subscriber_gets_the_full_history_after_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(SessionManager::new(dir.path()));
    let state = AppState::new(Arc::clone(&manager));

    let session = manager.create("replay", "/tmp").unwrap();
    let pane = session.ensure_main_pane().unwrap();
    pane.hydrate_scrollback(b"AB".to_vec());

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let c1 = state.broadcaster.register(tx1);
    ws::subscribe_and_replay(&state, c1, &session.id);

    // More output lands in the scrollback and is broadcast live.
    pane.hydrate_scrollback(b"ABCD".to_vec());
    state.broadcaster.broadcast_output(&session.id, b"CD");

    // A late subscriber starts from the current snapshot.
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let c2 = state.broadcaster.register(tx2);
    ws::subscribe_and_replay(&state, c2, &session.id);

    let collect = |rx: &mut mpsc::UnboundedReceiver<ServerMessage>| {
        let mut bytes = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Some(chunk) = decoded_output(&msg) {
                bytes.extend_from_slice(&chunk);
            }
        }
        bytes
    };

    assert_eq!(collect(&mut rx1), b"ABCD");
    assert_eq!(collect(&mut rx2), b"ABCD");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shell_session_round_trip_reaches_subscribers_and_disk() {
    unsafe { std::env::set_var("SHELL", "/bin/sh") };

    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(SessionManager::new(dir.path()));
    let state = AppState::new(Arc::clone(&manager));

    let session = manager.create("A", "/tmp").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = state.broadcaster.register(tx);
    ws::subscribe_and_replay(&state, conn, &session.id);

    ws::start_session(&state, &session, TerminalSize { rows: 24, cols: 80 }).await;

    // The start is announced as a shell status frame (live output chunks
    // may interleave around it).
    let status_deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        let remaining = status_deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("shell status frame within 500ms");
        let Ok(Some(msg)) = tokio::time::timeout(remaining, rx.recv()).await else {
            panic!("subscriber channel closed early");
        };
        if let ServerMessage::Status { status, .. } = msg {
            assert_eq!(status, Status::Shell);
            break;
        }
    }

    session.write(b"echo flow-check\n").unwrap();

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("echoed output before the deadline");
        let Ok(Some(msg)) = tokio::time::timeout(remaining, rx.recv()).await else {
            panic!("subscriber channel closed early");
        };
        if let Some(bytes) = decoded_output(&msg) {
            seen.extend_from_slice(&bytes);
            if String::from_utf8_lossy(&seen).contains("flow-check") {
                break;
            }
        }
    }

    ws::stop_session(&state, &session.id);
    assert_eq!(session.status(), Status::Stopped);

    // Exactly one stopped frame follows.
    let mut stopped_frames = 0;
    while let Ok(msg) = rx.try_recv() {
        if let ServerMessage::Status { status, .. } = msg
            && status == Status::Stopped
        {
            stopped_frames += 1;
        }
    }
    ws::stop_session(&state, &session.id);
    while let Ok(msg) = rx.try_recv() {
        if let ServerMessage::Status { status, .. } = msg
            && status == Status::Stopped
        {
            stopped_frames += 1;
        }
    }
    assert_eq!(stopped_frames, 1);

    // The forced save at stop left the scrollback on disk.
    let path = dir.path().join(format!("{}.scrollback", session.id));
    let saved = std::fs::read(&path).expect("scrollback file exists");
    assert!(!saved.is_empty());
    assert!(saved.len() <= claudex_core::SCROLLBACK_MAX_BYTES);
}
