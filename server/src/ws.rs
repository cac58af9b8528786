use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::response::IntoResponse;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use chrono::Utc;
use claudex_core::OutputCallback;
use claudex_core::Session;
use claudex_core::Status;
use claudex_core::StatusCallback;
use claudex_core::agent;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::AppState;

/// How often a freshly started shell is polled for a new agent session.
const AGENT_DETECT_INTERVAL: Duration = Duration::from_secs(2);
/// How long the detection poll keeps looking before giving up.
const AGENT_DETECT_WINDOW: Duration = Duration::from_secs(300);
/// Saved agent sessions older than this are not resumed.
const RESUME_MAX_AGE_HOURS: i64 = 24;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl TerminalSize {
    fn or_default(size: Option<Self>) -> Self {
        match size {
            Some(size) if size.rows > 0 && size.cols > 0 => size,
            _ => Self::default(),
        }
    }
}

/// Messages a client may send over the realtime channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        session_id: String,
    },
    Unsubscribe {
        session_id: String,
    },
    /// `data` is written verbatim to the PTY.
    Input {
        session_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        data: TerminalSize,
    },
    Start {
        session_id: String,
        #[serde(default)]
        data: Option<TerminalSize>,
    },
    Stop {
        session_id: String,
    },
    Restart {
        session_id: String,
        #[serde(default)]
        data: Option<TerminalSize>,
    },
}

/// Frames pushed from the server to subscribed clients. Output bytes are
/// base64 encoded so binary PTY data survives the text transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output { session_id: String, data: String },
    Status { session_id: String, status: Status },
}

struct ConnectionHandle {
    subscriptions: HashSet<String>,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

/// Subscription registry and fan-out. Each connection owns an ordered outbox
/// drained by a single writer task, which serializes all writes to that
/// transport; a slow consumer therefore only ever delays itself. For one
/// session, frames are enqueued in the order the read loop emitted them.
#[derive(Default)]
pub struct Broadcaster {
    next_conn_id: AtomicU64,
    connections: RwLock<HashMap<u64, ConnectionHandle>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, outbox: mpsc::UnboundedSender<ServerMessage>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(
                conn_id,
                ConnectionHandle {
                    subscriptions: HashSet::new(),
                    outbox,
                },
            );
        } else {
            warn!(conn_id, "connection registry poisoned, connection will receive nothing");
        }
        conn_id
    }

    /// Drops the connection and with it all of its subscriptions.
    pub fn unregister(&self, conn_id: u64) {
        if let Ok(mut connections) = self.connections.write() {
            connections.remove(&conn_id);
        }
    }

    pub fn subscribe(&self, conn_id: u64, session_id: &str) {
        if let Ok(mut connections) = self.connections.write()
            && let Some(conn) = connections.get_mut(&conn_id)
        {
            conn.subscriptions.insert(session_id.to_string());
        }
    }

    pub fn unsubscribe(&self, conn_id: u64, session_id: &str) {
        if let Ok(mut connections) = self.connections.write()
            && let Some(conn) = connections.get_mut(&conn_id)
        {
            conn.subscriptions.remove(session_id);
        }
    }

    /// Queues a frame for one connection regardless of its subscriptions,
    /// e.g. the scrollback snapshot sent on subscribe.
    pub fn send_to(&self, conn_id: u64, message: ServerMessage) {
        if let Ok(connections) = self.connections.read()
            && let Some(conn) = connections.get(&conn_id)
        {
            let _ = conn.outbox.send(message);
        }
    }

    pub fn broadcast_output(&self, session_id: &str, data: &[u8]) {
        self.broadcast(
            session_id,
            ServerMessage::Output {
                session_id: session_id.to_string(),
                data: BASE64.encode(data),
            },
        );
    }

    pub fn broadcast_status(&self, session_id: &str, status: Status) {
        self.broadcast(
            session_id,
            ServerMessage::Status {
                session_id: session_id.to_string(),
                status,
            },
        );
    }

    fn broadcast(&self, session_id: &str, message: ServerMessage) {
        let Ok(connections) = self.connections.read() else {
            return;
        };
        for conn in connections.values() {
            if conn.subscriptions.contains(session_id) {
                // A closed outbox only means this connection is going away.
                let _ = conn.outbox.send(message.clone());
            }
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = state.broadcaster.register(outbox_tx);
    debug!(conn_id, "websocket connected");

    // Single writer per connection: frames leave in queue order.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(conn_id, error = %err, "websocket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_message(&state, conn_id, message).await,
                Err(err) => {
                    // Malformed frames are dropped; the connection lives on.
                    warn!(conn_id, error = %err, "dropping malformed message");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.broadcaster.unregister(conn_id);
    writer.abort();
    debug!(conn_id, "websocket disconnected");
}

async fn handle_message(state: &AppState, conn_id: u64, message: ClientMessage) {
    match message {
        ClientMessage::Subscribe { session_id } => subscribe_and_replay(state, conn_id, &session_id),
        ClientMessage::Unsubscribe { session_id } => {
            state.broadcaster.unsubscribe(conn_id, &session_id);
        }
        ClientMessage::Input { session_id, data } => handle_input(state, &session_id, &data),
        ClientMessage::Resize { session_id, data } => {
            let Some(session) = state.manager.get(&session_id) else {
                warn!(%session_id, "resize for unknown session");
                return;
            };
            if let Err(err) = session.resize(data.rows, data.cols) {
                warn!(%session_id, error = %err, "resize failed");
            }
        }
        ClientMessage::Start { session_id, data } => {
            let size = TerminalSize::or_default(data);
            let Some(session) = state.manager.get(&session_id) else {
                warn!(%session_id, "start for unknown session");
                return;
            };
            // The starting client is implicitly a subscriber.
            subscribe_and_replay(state, conn_id, &session_id);
            start_session(state, &session, size).await;
        }
        ClientMessage::Stop { session_id } => stop_session(state, &session_id),
        ClientMessage::Restart { session_id, data } => {
            // Always size from the current message, never a cached value.
            let size = TerminalSize::or_default(data);
            let Some(session) = state.manager.get(&session_id) else {
                warn!(%session_id, "restart for unknown session");
                return;
            };
            session.reset();
            start_session(state, &session, size).await;
        }
    }
}

/// Registers the subscription first, then queues the scrollback snapshot on
/// the connection's ordered outbox. A chunk broadcast in between may arrive
/// twice; a gap cannot occur.
pub fn subscribe_and_replay(state: &AppState, conn_id: u64, session_id: &str) {
    state.broadcaster.subscribe(conn_id, session_id);

    let Some(session) = state.manager.get(session_id) else {
        return;
    };
    if session.update_cwd()
        && let Err(err) = state.manager.save_session(&session)
    {
        warn!(session_id, error = %err, "failed to save session after cwd change");
    }

    let scrollback = session.scrollback();
    if !scrollback.is_empty() {
        state.broadcaster.send_to(
            conn_id,
            ServerMessage::Output {
                session_id: session_id.to_string(),
                data: BASE64.encode(&scrollback),
            },
        );
    }
}

fn handle_input(state: &AppState, session_id: &str, data: &str) {
    let Some(session) = state.manager.get(session_id) else {
        warn!(session_id, "input for unknown session");
        return;
    };
    if let Err(err) = session.set_last_input_at(Utc::now()) {
        warn!(session_id, error = %err, "failed to record input time");
    }
    if let Err(err) = session.write(data.as_bytes()) {
        warn!(session_id, error = %err, "input write failed");
    }
}

/// Saves metadata and scrollback, stops every pane and announces exactly
/// one stopped status to subscribers.
pub fn stop_session(state: &AppState, session_id: &str) {
    let Some(session) = state.manager.get(session_id) else {
        return;
    };
    // Forced save before the child goes away; this also refreshes the cwd.
    state.saver.flush(session_id);

    if let Some(status) = session.stop() {
        state.broadcaster.broadcast_status(session_id, status);
        if let Err(err) = state.manager.save_session(&session) {
            warn!(session_id, error = %err, "failed to save session after stop");
        }
    }
}

/// Starts (or resumes) the session's main pane and wires its callbacks into
/// the fan-out layer and the debounced saver.
pub async fn start_session(state: &AppState, session: &Arc<Session>, size: TerminalSize) {
    let session_id = session.id.clone();

    let on_output: OutputCallback = {
        let broadcaster = Arc::clone(&state.broadcaster);
        let saver = Arc::clone(&state.saver);
        let session_id = session_id.clone();
        Arc::new(move |data: &[u8]| {
            broadcaster.broadcast_output(&session_id, data);
            saver.schedule(&session_id);
        })
    };
    let on_status: StatusCallback = {
        let broadcaster = Arc::clone(&state.broadcaster);
        let session_id = session_id.clone();
        Arc::new(move |status: Status| {
            broadcaster.broadcast_status(&session_id, status);
        })
    };

    // Resume the saved agent session when the oracle still knows it and it
    // is fresh enough; otherwise fall back to a plain shell.
    if let Some(saved) = session.last_agent_session_id() {
        let directory = session.directory();
        let entry = tokio::task::spawn_blocking(move || agent::find_active_session(&directory))
            .await
            .ok()
            .flatten();
        if let Some(entry) = entry
            && entry.session_id == saved
            && is_recent(&entry.modified)
        {
            info!(%session_id, agent_session_id = %saved, "resuming saved agent session");
            match session.resume(&saved, size.rows, size.cols, on_output.clone(), on_status.clone())
            {
                Ok(()) => {
                    state
                        .broadcaster
                        .broadcast_status(&session_id, session.status());
                    return;
                }
                Err(err) => {
                    warn!(%session_id, error = %err, "resume failed, falling back to shell");
                }
            }
        }
    }

    match session.start(size.rows, size.cols, on_output, on_status) {
        Ok(()) => {
            state
                .broadcaster
                .broadcast_status(&session_id, session.status());
            spawn_agent_detection(state.clone(), Arc::clone(session));
        }
        Err(err) => {
            warn!(%session_id, error = %err, "failed to start session");
            state
                .broadcaster
                .broadcast_status(&session_id, session.status());
        }
    }
}

fn is_recent(modified: &str) -> bool {
    DateTime::parse_from_rfc3339(modified).is_ok_and(|at| {
        Utc::now() - at.with_timezone(&Utc) < chrono::Duration::hours(RESUME_MAX_AGE_HOURS)
    })
}

/// After a plain-shell start, watches the oracle for a new agent session in
/// the session's directory and records its id for later resumes.
fn spawn_agent_detection(state: AppState, session: Arc<Session>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(AGENT_DETECT_INTERVAL);
        ticker.tick().await;
        let deadline = tokio::time::Instant::now() + AGENT_DETECT_WINDOW;
        let mut last_seen: Option<String> = None;

        loop {
            ticker.tick().await;
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            if session.status() == Status::Stopped {
                return;
            }

            let directory = session.directory();
            let entry =
                match tokio::task::spawn_blocking(move || agent::find_active_session(&directory))
                    .await
                {
                    Ok(entry) => entry,
                    Err(_) => return,
                };
            let Some(entry) = entry else {
                continue;
            };
            if last_seen.as_deref() == Some(entry.session_id.as_str()) {
                continue;
            }
            last_seen = Some(entry.session_id.clone());

            if session.last_agent_session_id().as_deref() != Some(entry.session_id.as_str()) {
                info!(
                    session_id = %session.id,
                    agent_session_id = %entry.session_id,
                    "detected new agent session"
                );
                if let Err(err) = session
                    .set_last_agent_session_id(entry.session_id.clone())
                    .and_then(|()| state.manager.save_session(&session))
                {
                    warn!(session_id = %session.id, error = %err, "failed to save detected agent session");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn client_messages_parse_from_wire_shapes() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","session_id":"abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { session_id } if session_id == "abc"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"input","session_id":"abc","data":"echo hi\n"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Input { data, .. } if data == "echo hi\n"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"resize","session_id":"abc","data":{"rows":40,"cols":120}}"#,
        )
        .unwrap();
        assert!(
            matches!(msg, ClientMessage::Resize { data, .. } if data.rows == 40 && data.cols == 120)
        );

        // Start without an explicit size falls back to 24x80.
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"start","session_id":"abc"}"#).unwrap();
        let ClientMessage::Start { data, .. } = msg else {
            panic!("expected start");
        };
        let size = TerminalSize::or_default(data);
        assert_eq!((size.rows, size.cols), (24, 80));
    }

    #[test]
    fn malformed_messages_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn server_messages_serialize_with_type_tags() {
        let json = serde_json::to_value(ServerMessage::Status {
            session_id: "abc".into(),
            status: Status::Thinking,
        })
        .unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "thinking");

        let json = serde_json::to_value(ServerMessage::Output {
            session_id: "abc".into(),
            data: BASE64.encode(b"hi"),
        })
        .unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], "aGk=");
    }

    #[test]
    fn broadcast_reaches_only_subscribers_in_emit_order() {
        let broadcaster = Broadcaster::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let c1 = broadcaster.register(tx1);
        let c2 = broadcaster.register(tx2);

        broadcaster.subscribe(c1, "s1");
        broadcaster.subscribe(c2, "s1");
        broadcaster.subscribe(c2, "s2");

        broadcaster.broadcast_output("s1", b"X");
        broadcaster.broadcast_output("s1", b"Y");
        broadcaster.broadcast_output("s2", b"Z");

        let seen1 = drain(&mut rx1);
        let seen2 = drain(&mut rx2);
        let payloads = |msgs: &[ServerMessage]| -> Vec<String> {
            msgs.iter()
                .map(|m| match m {
                    ServerMessage::Output { data, .. } => data.clone(),
                    ServerMessage::Status { .. } => panic!("unexpected status"),
                })
                .collect()
        };

        assert_eq!(payloads(&seen1), vec![BASE64.encode(b"X"), BASE64.encode(b"Y")]);
        assert_eq!(
            payloads(&seen2),
            vec![
                BASE64.encode(b"X"),
                BASE64.encode(b"Y"),
                BASE64.encode(b"Z")
            ]
        );
    }

    #[test]
    fn unsubscribe_and_unregister_stop_delivery() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = broadcaster.register(tx);
        broadcaster.subscribe(conn, "s1");

        broadcaster.broadcast_status("s1", Status::Shell);
        broadcaster.unsubscribe(conn, "s1");
        broadcaster.broadcast_status("s1", Status::Thinking);
        assert_eq!(drain(&mut rx).len(), 1);

        broadcaster.subscribe(conn, "s1");
        broadcaster.unregister(conn);
        broadcaster.broadcast_status("s1", Status::Stopped);
        assert_eq!(drain(&mut rx).len(), 0);
    }

    #[test]
    fn stale_agent_sessions_are_not_recent() {
        assert!(!is_recent("2020-01-01T00:00:00Z"));
        assert!(is_recent(&Utc::now().to_rfc3339()));
        assert!(!is_recent("garbage"));
    }
}
