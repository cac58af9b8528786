use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use chrono::DateTime;
use chrono::Utc;
use claudex_core::Customization;
use claudex_core::ManagerError;
use claudex_core::SessionInfo;
use claudex_core::agent;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

/// Control-plane failures mapped onto HTTP statuses. The body is always a
/// single `{"error": ...}` object.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::SessionNotFound { .. } | ManagerError::PaneNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub hex_q: Option<i32>,
    #[serde(default)]
    pub hex_r: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    state.manager.update_all_cwds();
    let mut infos: Vec<SessionInfo> = state
        .manager
        .list()
        .iter()
        .filter_map(|s| s.info().ok())
        .collect();
    infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(infos)
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let directory = if req.directory.is_empty() {
        dirs::home_dir()
            .map(|home| home.display().to_string())
            .ok_or_else(|| ApiError::Internal("cannot determine home directory".to_string()))?
    } else {
        expand_home(&req.directory)
    };

    let session = state.manager.create(req.name, directory)?;
    if let (Some(q), Some(r)) = (req.hex_q, req.hex_r) {
        session.set_hex_position(q, r)?;
        state.manager.save_session(&session)?;
    }
    Ok(Json(session.info()?))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.delete(&id)?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))?;
    session.set_name(req.name)?;
    state.manager.save_session(&session)?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn customize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(fields): Json<Customization>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))?;
    session.apply_customization(fields)?;
    state.manager.save_session(&session)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Current agent activity for the session's directory, straight from the
/// transcript oracle.
pub async fn agent_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<agent::AgentState>, ApiError> {
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))?;
    let directory = session.directory();
    let agent_state = tokio::task::spawn_blocking(move || agent::get_state(&directory))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(Json(agent_state))
}

/// Whether a resumable agent session exists for the session's directory.
pub async fn agent_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .manager
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {id}")))?;
    let directory = session.directory();
    let entry = tokio::task::spawn_blocking(move || agent::find_active_session(&directory))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let Some(entry) = entry else {
        return Ok(Json(json!({ "available": false })));
    };

    let is_recent = DateTime::parse_from_rfc3339(&entry.modified)
        .is_ok_and(|at| Utc::now() - at.with_timezone(&Utc) < chrono::Duration::hours(24));

    Ok(Json(json!({
        "available": is_recent,
        "sessionId": entry.session_id,
        "firstPrompt": entry.first_prompt,
        "messageCount": entry.message_count,
        "modified": entry.modified,
        "gitBranch": entry.git_branch,
    })))
}

pub async fn get_client_state(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.manager.client_state()?))
}

pub async fn put_client_state(
    State(state): State<AppState>,
    Json(doc): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.set_client_state(&doc)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Expands a leading `~` to the user's home directory.
pub(crate) fn expand_home(path: &str) -> String {
    if !path.starts_with('~') {
        return path.to_string();
    }
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    if path.len() == 1 {
        home.display().to_string()
    } else {
        format!("{}{}", home.display(), &path[1..])
    }
}
