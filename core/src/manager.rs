use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::error::ManagerError;
use crate::session::Session;
use crate::session::SessionInfo;

const CLIENT_STATE_FILE: &str = "client-state.json";
const SCROLLBACK_EXT: &str = "scrollback";

/// Registry of sessions plus their JSON metadata and scrollback persistence.
///
/// The registry map is guarded by one readers-writer lock; enumeration takes
/// a snapshot of `Arc<Session>` handles, which is safe because sessions are
/// internally synchronized. Files under the storage directory are owned by
/// exactly one session id.
pub struct SessionManager {
    storage_dir: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    /// Opens (creating if needed) the storage directory and loads every
    /// persisted session.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let storage_dir = storage_dir.into();
        if let Err(err) = std::fs::create_dir_all(&storage_dir) {
            warn!(error = %err, dir = %storage_dir.display(), "failed to create storage dir");
        }
        let manager = Self {
            storage_dir,
            sessions: RwLock::new(HashMap::new()),
        };
        manager.load_sessions();
        manager
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Creates a session with a fresh short id and persists it immediately.
    pub fn create(
        &self,
        name: impl Into<String>,
        directory: impl Into<String>,
    ) -> Result<Arc<Session>, ManagerError> {
        let id = short_id();
        let session = Arc::new(Session::new(id.clone(), name, directory));
        self.sessions
            .write()
            .map_err(|_| ManagerError::Poisoned)?
            .insert(id, Arc::clone(&session));
        self.save_session(&session)?;
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().ok()?.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops a session's panes and removes it along with its metadata and
    /// scrollback files.
    pub fn delete(&self, id: &str) -> Result<(), ManagerError> {
        let session = self
            .sessions
            .write()
            .map_err(|_| ManagerError::Poisoned)?
            .remove(id)
            .ok_or_else(|| ManagerError::session_not_found(id))?;
        session.stop();

        let _ = std::fs::remove_file(self.metadata_path(id));
        let _ = std::fs::remove_file(self.scrollback_path(id));
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Creates a child session rooted in a git worktree. The worktree itself
    /// is created by the caller beforehand.
    pub fn create_experiment(
        &self,
        parent_id: &str,
        branch_name: &str,
        worktree_path: &str,
    ) -> Result<Arc<Session>, ManagerError> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| ManagerError::session_not_found(parent_id))?;

        let id = short_id();
        let name = format!("Exp: {branch_name}");
        let session = Arc::new(Session::new(id.clone(), name, worktree_path));
        session.set_experiment_links(parent_id, branch_name, worktree_path, parent.color())?;

        self.sessions
            .write()
            .map_err(|_| ManagerError::Poisoned)?
            .insert(id, Arc::clone(&session));
        self.save_session(&session)?;
        Ok(session)
    }

    /// Rewrites a session's metadata file.
    pub fn save_session(&self, session: &Session) -> Result<(), ManagerError> {
        let info = session.info()?;
        let data = serde_json::to_vec_pretty(&info)
            .map_err(|error| ManagerError::Serialize { error })?;
        write_atomic(&self.metadata_path(&session.id), &data)
            .map_err(ManagerError::persistence)
    }

    /// Writes the session's current scrollback snapshot. Empty scrollback
    /// leaves any previous file untouched.
    pub fn save_scrollback(&self, session: &Session) -> Result<(), ManagerError> {
        let scrollback = session.scrollback();
        if scrollback.is_empty() {
            return Ok(());
        }
        write_atomic(&self.scrollback_path(&session.id), &scrollback)
            .map_err(ManagerError::persistence)
    }

    /// Refreshes the cwd of every running session, persisting changes.
    pub fn update_all_cwds(&self) {
        for session in self.list() {
            if session.update_cwd()
                && let Err(err) = self.save_session(&session)
            {
                warn!(session_id = %session.id, error = %err, "failed to save session after cwd change");
            }
        }
    }

    /// Forced save of all metadata and scrollback, used at shutdown.
    pub fn save_all(&self) {
        for session in self.list() {
            session.update_cwd();
            if let Err(err) = self.save_session(&session) {
                warn!(session_id = %session.id, error = %err, "failed to save session metadata");
            }
            if let Err(err) = self.save_scrollback(&session) {
                warn!(session_id = %session.id, error = %err, "failed to save scrollback");
            }
        }
    }

    /// Stops every session and saves final state. There must be no orphan
    /// children after this returns.
    pub fn shutdown(&self) {
        self.save_all();
        for session in self.list() {
            session.stop();
        }
    }

    /// The opaque UI-preferences document. The core round-trips it without
    /// interpreting the schema.
    pub fn client_state(&self) -> Result<serde_json::Value, ManagerError> {
        let path = self.storage_dir.join(CLIENT_STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|error| ManagerError::Serialize { error }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(serde_json::Value::Object(Default::default()))
            }
            Err(error) => Err(ManagerError::persistence(error)),
        }
    }

    pub fn set_client_state(&self, state: &serde_json::Value) -> Result<(), ManagerError> {
        let data = serde_json::to_vec_pretty(state)
            .map_err(|error| ManagerError::Serialize { error })?;
        write_atomic(&self.storage_dir.join(CLIENT_STATE_FILE), &data)
            .map_err(ManagerError::persistence)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(format!("{id}.json"))
    }

    fn scrollback_path(&self, id: &str) -> PathBuf {
        self.storage_dir.join(format!("{id}.{SCROLLBACK_EXT}"))
    }

    /// Loads every `*.json` metadata file except the client-state document.
    /// Corrupt files are skipped; startup always continues.
    fn load_sessions(&self) {
        let entries = match std::fs::read_dir(&self.storage_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "failed to read storage dir");
                return;
            }
        };

        let Ok(mut sessions) = self.sessions.write() else {
            warn!("session registry lock poisoned, skipping load");
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(CLIENT_STATE_FILE) {
                continue;
            }

            let data = match std::fs::read_to_string(&path) {
                Ok(data) => data,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping unreadable session file");
                    continue;
                }
            };
            let info: SessionInfo = match serde_json::from_str(&data) {
                Ok(info) => info,
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping corrupt session file");
                    continue;
                }
            };

            let session = Arc::new(Session::from_info(info));
            let scrollback_path = self.scrollback_path(&session.id);
            if let Ok(scrollback) = std::fs::read(&scrollback_path)
                && !scrollback.is_empty()
                && let Ok(pane) = session.ensure_main_pane()
            {
                pane.hydrate_scrollback(scrollback);
            }

            debug!(session_id = %session.id, "session restored");
            sessions.insert(session.id.clone(), session);
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Writes the full contents to a sibling temp file, then renames it into
/// place so readers never observe a partial file.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
