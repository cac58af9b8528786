use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::ManagerError;
use crate::error::PaneError;
use crate::layout::Layout;
use crate::layout::SplitDirection;
use crate::pane::OutputCallback;
use crate::pane::Pane;
use crate::pane::StatusCallback;
use crate::status::Status;

const MAIN_PANE_ID: &str = "main";
const DEFAULT_COLOR: &str = "#6366f1";

/// Serializable snapshot of a session's metadata. This is both the
/// persistence format (`<storage>/<id>.json`) and the REST representation.
/// Unknown fields are ignored on load; empty optional fields are omitted on
/// save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex_q: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex_r: Option<i32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_input_at: Option<DateTime<Utc>>,
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_agent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_accessory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Layout>,
}

/// Optional customization fields; only the provided ones are applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Customization {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub robot_model: Option<String>,
    #[serde(default)]
    pub robot_color: Option<String>,
    #[serde(default)]
    pub robot_accessory: Option<String>,
}

struct SessionState {
    name: String,
    directory: String,
    status: Status,
    color: String,
    hex_q: Option<i32>,
    hex_r: Option<i32>,
    metadata: HashMap<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_input_at: Option<DateTime<Utc>>,
    parent_id: Option<String>,
    worktree_path: Option<String>,
    branch: Option<String>,
    last_agent_session_id: Option<String>,
    robot_model: Option<String>,
    robot_color: Option<String>,
    robot_accessory: Option<String>,
    panes: HashMap<String, Arc<Pane>>,
    layout: Option<Layout>,
}

/// A logical grouping of panes sharing metadata, working directory and an
/// aggregate status. Operations target the main pane (the layout root's
/// leftmost leaf) unless a pane id is given. The session exclusively owns
/// its panes; external collaborators hold only the session id.
pub struct Session {
    pub id: String,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(id: impl Into<String>, name: impl Into<String>, directory: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: RwLock::new(SessionState {
                name: name.into(),
                directory: directory.into(),
                status: Status::Idle,
                color: DEFAULT_COLOR.to_string(),
                hex_q: None,
                hex_r: None,
                metadata: HashMap::new(),
                created_at: now,
                updated_at: now,
                last_input_at: None,
                parent_id: None,
                worktree_path: None,
                branch: None,
                last_agent_session_id: None,
                robot_model: None,
                robot_color: None,
                robot_accessory: None,
                panes: HashMap::new(),
                layout: None,
            }),
        }
    }

    /// Reconstructs a session from persisted metadata. Runtime state cannot
    /// be resumed, so the status is normalized to idle and every layout leaf
    /// gets a fresh inactive pane.
    pub fn from_info(info: SessionInfo) -> Self {
        let mut panes = HashMap::new();
        if let Some(layout) = &info.layout {
            for pane_id in layout.pane_ids() {
                panes.insert(
                    pane_id.to_string(),
                    Arc::new(Pane::new(pane_id, info.directory.clone())),
                );
            }
        }
        Self {
            id: info.id,
            state: RwLock::new(SessionState {
                name: info.name,
                directory: info.directory,
                status: Status::Idle,
                color: if info.color.is_empty() {
                    DEFAULT_COLOR.to_string()
                } else {
                    info.color
                },
                hex_q: info.hex_q,
                hex_r: info.hex_r,
                metadata: info.metadata,
                created_at: info.created_at,
                updated_at: info.updated_at,
                last_input_at: info.last_input_at,
                parent_id: info.parent_id,
                worktree_path: info.worktree_path,
                branch: info.branch,
                last_agent_session_id: info.last_agent_session_id,
                robot_model: info.robot_model,
                robot_color: info.robot_color,
                robot_accessory: info.robot_accessory,
                panes,
                layout: info.layout,
            }),
        }
    }

    pub fn info(&self) -> Result<SessionInfo, ManagerError> {
        let state = self.state.read().map_err(|_| ManagerError::Poisoned)?;
        Ok(SessionInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            status: state.status,
            color: state.color.clone(),
            hex_q: state.hex_q,
            hex_r: state.hex_r,
            metadata: state.metadata.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            last_input_at: state.last_input_at,
            directory: state.directory.clone(),
            parent_id: state.parent_id.clone(),
            worktree_path: state.worktree_path.clone(),
            branch: state.branch.clone(),
            last_agent_session_id: state.last_agent_session_id.clone(),
            robot_model: state.robot_model.clone(),
            robot_color: state.robot_color.clone(),
            robot_accessory: state.robot_accessory.clone(),
            layout: state.layout.clone(),
        })
    }

    pub fn name(&self) -> String {
        self.state.read().map(|s| s.name.clone()).unwrap_or_default()
    }

    pub fn directory(&self) -> String {
        self.state
            .read()
            .map(|s| s.directory.clone())
            .unwrap_or_default()
    }

    /// A poisoned session reads as errored rather than panicking callers.
    pub fn status(&self) -> Status {
        self.state.read().map(|s| s.status).unwrap_or(Status::Error)
    }

    pub fn color(&self) -> String {
        self.state.read().map(|s| s.color.clone()).unwrap_or_default()
    }

    pub fn last_agent_session_id(&self) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.last_agent_session_id.clone())
    }

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        state.name = name.into();
        state.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_hex_position(&self, q: i32, r: i32) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        state.hex_q = Some(q);
        state.hex_r = Some(r);
        state.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_metadata(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        state.metadata.insert(key.into(), value);
        state.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_last_agent_session_id(&self, id: impl Into<String>) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        state.last_agent_session_id = Some(id.into());
        state.updated_at = Utc::now();
        Ok(())
    }

    pub fn set_last_input_at(&self, at: DateTime<Utc>) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        state.last_input_at = Some(at);
        Ok(())
    }

    pub fn apply_customization(&self, fields: Customization) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        if let Some(name) = fields.name {
            state.name = name;
        }
        if let Some(model) = fields.robot_model {
            state.robot_model = Some(model);
        }
        if let Some(color) = fields.robot_color {
            state.robot_color = Some(color);
        }
        if let Some(accessory) = fields.robot_accessory {
            state.robot_accessory = Some(accessory);
        }
        state.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn set_experiment_links(
        &self,
        parent_id: impl Into<String>,
        branch: impl Into<String>,
        worktree_path: impl Into<String>,
        color: impl Into<String>,
    ) -> Result<(), ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        state.parent_id = Some(parent_id.into());
        state.branch = Some(branch.into());
        state.worktree_path = Some(worktree_path.into());
        state.color = color.into();
        state.updated_at = Utc::now();
        Ok(())
    }

    /// The pane referenced by the layout root, creating it (and the layout)
    /// on first use.
    pub fn ensure_main_pane(&self) -> Result<Arc<Pane>, PaneError> {
        let mut state = self.state.write().map_err(|_| PaneError::Poisoned)?;
        if state.layout.is_none() {
            let pane = Arc::new(Pane::new(MAIN_PANE_ID, state.directory.clone()));
            state.panes.insert(MAIN_PANE_ID.to_string(), Arc::clone(&pane));
            state.layout = Some(Layout::leaf(MAIN_PANE_ID));
            return Ok(pane);
        }
        let main_id = state
            .layout
            .as_ref()
            .map(|l| l.main_pane().to_string())
            .unwrap_or_default();
        let directory = state.directory.clone();
        Ok(state
            .panes
            .entry(main_id.clone())
            .or_insert_with(|| Arc::new(Pane::new(main_id, directory)))
            .clone())
    }

    /// Adds a pane with the session's working directory. The first pane
    /// becomes the layout root.
    pub fn create_pane(&self, id: &str) -> Result<Arc<Pane>, ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        if let Some(existing) = state.panes.get(id) {
            return Ok(Arc::clone(existing));
        }
        let pane = Arc::new(Pane::new(id, state.directory.clone()));
        state.panes.insert(id.to_string(), Arc::clone(&pane));
        if state.layout.is_none() {
            state.layout = Some(Layout::leaf(id));
        }
        state.updated_at = Utc::now();
        Ok(pane)
    }

    pub fn main_pane(&self) -> Option<Arc<Pane>> {
        let state = self.state.read().ok()?;
        let main_id = state.layout.as_ref()?.main_pane();
        state.panes.get(main_id).cloned()
    }

    pub fn pane(&self, pane_id: &str) -> Option<Arc<Pane>> {
        self.state.read().ok()?.panes.get(pane_id).cloned()
    }

    /// Splits the leaf holding `existing_id`, creating a new pane that
    /// inherits the session's working directory.
    pub fn split_pane(
        &self,
        existing_id: &str,
        new_id: &str,
        direction: SplitDirection,
    ) -> Result<Arc<Pane>, ManagerError> {
        let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
        let Some(layout) = state.layout.as_mut() else {
            return Err(ManagerError::PaneNotFound {
                id: existing_id.to_string(),
            });
        };
        if !layout.split(existing_id, new_id, direction) {
            return Err(ManagerError::PaneNotFound {
                id: existing_id.to_string(),
            });
        }
        let pane = Arc::new(Pane::new(new_id, state.directory.clone()));
        state.panes.insert(new_id.to_string(), Arc::clone(&pane));
        state.updated_at = Utc::now();
        Ok(pane)
    }

    /// Stops and removes a pane, collapsing the layout around it.
    pub fn remove_pane(&self, pane_id: &str) -> Result<(), ManagerError> {
        let pane = {
            let mut state = self.state.write().map_err(|_| ManagerError::Poisoned)?;
            let Some(pane) = state.panes.remove(pane_id) else {
                return Err(ManagerError::PaneNotFound {
                    id: pane_id.to_string(),
                });
            };
            state.layout = state.layout.take().and_then(|l| l.remove(pane_id));
            state.updated_at = Utc::now();
            pane
        };
        pane.stop();
        self.update_aggregate_status();
        Ok(())
    }

    /// Starts the main pane as a plain shell.
    pub fn start(
        self: &Arc<Self>,
        rows: u16,
        cols: u16,
        on_output: OutputCallback,
        on_status: StatusCallback,
    ) -> Result<(), PaneError> {
        let pane = self.ensure_main_pane()?;
        let wrapped = self.wrap_status_callback(on_status);
        let started = pane.start(rows, cols, on_output, wrapped);
        // A spawn failure leaves the pane in error; surface it either way.
        self.update_aggregate_status();
        started
    }

    /// Starts the main pane by resuming a previous agent session.
    pub fn resume(
        self: &Arc<Self>,
        agent_session_id: &str,
        rows: u16,
        cols: u16,
        on_output: OutputCallback,
        on_status: StatusCallback,
    ) -> Result<(), PaneError> {
        let pane = self.ensure_main_pane()?;
        let wrapped = self.wrap_status_callback(on_status);
        let started = pane.resume(agent_session_id, rows, cols, on_output, wrapped);
        self.update_aggregate_status();
        started
    }

    /// Writes input to the main pane.
    pub fn write(&self, data: &[u8]) -> Result<usize, PaneError> {
        let pane = self.main_pane().ok_or(PaneError::Closed)?;
        pane.write(data)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PaneError> {
        let pane = self.main_pane().ok_or(PaneError::Closed)?;
        pane.resize(rows, cols)
    }

    /// Stops every pane. Returns the new aggregate status when it changed so
    /// the caller can announce exactly one stop.
    pub fn stop(&self) -> Option<Status> {
        let panes: Vec<Arc<Pane>> = match self.state.read() {
            Ok(state) => state.panes.values().cloned().collect(),
            Err(_) => return None,
        };
        for pane in &panes {
            pane.stop();
        }
        if panes.is_empty() {
            // Nothing ever ran; mark the session itself stopped once.
            let Ok(mut state) = self.state.write() else {
                return None;
            };
            if state.status == Status::Stopped {
                return None;
            }
            state.status = Status::Stopped;
            state.updated_at = Utc::now();
            return Some(Status::Stopped);
        }
        self.update_aggregate_status()
    }

    /// Resets every pane back to inactive and the session to idle. The next
    /// start gets fresh scrollback, tracker and child.
    pub fn reset(&self) {
        let panes: Vec<Arc<Pane>> = match self.state.read() {
            Ok(state) => state.panes.values().cloned().collect(),
            Err(_) => return,
        };
        for pane in &panes {
            pane.reset();
        }
        if let Ok(mut state) = self.state.write() {
            state.status = Status::Idle;
            state.updated_at = Utc::now();
        }
    }

    /// Scrollback of the main pane; empty when no pane exists yet.
    pub fn scrollback(&self) -> Vec<u8> {
        self.main_pane().map(|p| p.scrollback()).unwrap_or_default()
    }

    /// Recomputes the aggregate status as the maximum over pane statuses.
    /// Returns the new value when it changed.
    pub fn update_aggregate_status(&self) -> Option<Status> {
        let Ok(mut state) = self.state.write() else {
            return None;
        };
        let Some(new_status) = state.panes.values().map(|p| p.status()).max() else {
            return None;
        };
        if new_status == state.status {
            return None;
        }
        debug!(session_id = %self.id, from = %state.status, to = %new_status, "session status");
        state.status = new_status;
        state.updated_at = Utc::now();
        Some(new_status)
    }

    /// Refreshes `directory` from the main pane's child process. Returns
    /// true when it changed, signalling that metadata should be saved.
    pub fn update_cwd(&self) -> bool {
        let Some(pane) = self.main_pane() else {
            return false;
        };
        if !pane.is_running() {
            return false;
        }
        let cwd = pane.process_cwd();
        let Ok(mut state) = self.state.write() else {
            return false;
        };
        if cwd.is_empty() || cwd == state.directory {
            return false;
        }
        state.directory = cwd;
        state.updated_at = Utc::now();
        true
    }

    /// Chains a pane-level status change into the session aggregate and, on
    /// change, the registered broadcaster. Invoked outside all locks.
    fn wrap_status_callback(self: &Arc<Self>, on_status: StatusCallback) -> StatusCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |_pane_status| {
            if let Some(session) = weak.upgrade()
                && let Some(aggregate) = session.update_aggregate_status()
            {
                on_status(aggregate);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_status_is_the_maximum_over_panes() {
        let session = Arc::new(Session::new("s1", "test", "/tmp"));
        session.ensure_main_pane().unwrap();
        session
            .split_pane(MAIN_PANE_ID, "side", SplitDirection::Vertical)
            .unwrap();
        // Both panes are idle; aggregate stays idle (no change reported).
        assert_eq!(session.update_aggregate_status(), None);
        assert_eq!(session.status(), Status::Idle);
    }

    #[test]
    fn split_pane_inherits_session_directory() {
        let session = Session::new("s1", "test", "/tmp/workdir");
        session.ensure_main_pane().unwrap();
        let pane = session
            .split_pane(MAIN_PANE_ID, "side", SplitDirection::Horizontal)
            .unwrap();
        assert_eq!(pane.directory(), "/tmp/workdir");
    }

    #[test]
    fn split_then_remove_restores_single_leaf_layout() {
        let session = Session::new("s1", "test", "/tmp");
        session.ensure_main_pane().unwrap();
        session
            .split_pane(MAIN_PANE_ID, "side", SplitDirection::Vertical)
            .unwrap();
        session.remove_pane("side").unwrap();
        let info = session.info().unwrap();
        assert_eq!(info.layout, Some(Layout::leaf(MAIN_PANE_ID)));
        assert!(session.pane("side").is_none());
    }

    #[test]
    fn remove_unknown_pane_is_not_found() {
        let session = Session::new("s1", "test", "/tmp");
        session.ensure_main_pane().unwrap();
        assert!(matches!(
            session.remove_pane("ghost"),
            Err(ManagerError::PaneNotFound { .. })
        ));
    }

    #[test]
    fn stop_without_panes_reports_exactly_once() {
        let session = Session::new("s1", "test", "/tmp");
        assert_eq!(session.stop(), Some(Status::Stopped));
        assert_eq!(session.stop(), None);
    }

    #[test]
    fn info_round_trip_restores_metadata_and_normalizes_status() {
        let session = Session::new("s1", "demo", "/tmp");
        session.set_name("renamed").unwrap();
        session.set_hex_position(2, -1).unwrap();
        session.set_last_agent_session_id("agent-123").unwrap();
        session.set_metadata("key", serde_json::json!("value")).unwrap();
        session.ensure_main_pane().unwrap();

        let mut info = session.info().unwrap();
        info.status = Status::Thinking; // pretend it was saved mid-flight

        let json = serde_json::to_string(&info).unwrap();
        let parsed: SessionInfo = serde_json::from_str(&json).unwrap();
        let restored = Session::from_info(parsed);

        assert_eq!(restored.id, "s1");
        assert_eq!(restored.name(), "renamed");
        assert_eq!(restored.status(), Status::Idle);
        assert_eq!(
            restored.last_agent_session_id().as_deref(),
            Some("agent-123")
        );
        // The layout's panes were recreated as inactive panes.
        assert!(restored.main_pane().is_some());
        assert!(!restored.main_pane().unwrap().is_running());
    }

    #[test]
    fn unknown_metadata_fields_are_ignored_on_load() {
        let json = r##"{
            "id": "s9",
            "name": "legacy",
            "status": "shell",
            "color": "#abcdef",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-02T00:00:00Z",
            "directory": "/tmp",
            "some_future_field": {"nested": true}
        }"##;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.id, "s9");
        assert_eq!(info.color, "#abcdef");
    }
}
