//! HTTP + WebSocket surface for the Claudex session runtime: the realtime
//! subscription channel, the control-plane REST endpoints and the
//! git-worktree experiment flow.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use claudex_core::SessionManager;
use tower_http::services::ServeDir;

pub mod api;
pub mod saver;
pub mod worktree;
pub mod ws;

pub use saver::ScrollbackSaver;
pub use ws::Broadcaster;
pub use ws::ClientMessage;
pub use ws::ServerMessage;
pub use ws::TerminalSize;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub saver: Arc<ScrollbackSaver>,
}

impl AppState {
    /// Must be created from within the runtime; the saver captures the
    /// runtime handle so it can arm timers from PTY read threads.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            broadcaster: Arc::new(Broadcaster::new()),
            saver: Arc::new(ScrollbackSaver::new(Arc::clone(&manager))),
            manager,
        }
    }
}

/// The full route table. `web_dir`, when present, is served as the static
/// frontend at the root.
pub fn router(state: AppState, web_dir: Option<PathBuf>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/create", post(api::create_session))
        .route("/api/sessions/experiment", post(worktree::create_experiment))
        .route("/api/sessions/{id}", delete(api::delete_session))
        .route("/api/sessions/{id}/name", put(api::rename_session))
        .route("/api/sessions/{id}/customize", put(api::customize_session))
        .route("/api/sessions/{id}/agent-state", get(api::agent_state))
        .route("/api/sessions/{id}/agent-session", get(api::agent_session))
        .route(
            "/api/client-state",
            get(api::get_client_state).put(api::put_client_state),
        )
        .route("/api/worktree", get(worktree::info))
        .route("/api/worktree/merge", post(worktree::merge))
        .route("/api/worktree/discard", post(worktree::discard));

    if let Some(web_dir) = web_dir {
        router = router.fallback_service(ServeDir::new(web_dir));
    }

    router.with_state(state)
}
