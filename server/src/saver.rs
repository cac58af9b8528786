use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use claudex_core::SessionManager;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// Quiescence interval between the last output burst and the durable save.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Debounced scrollback persistence. Every output burst schedules a save 5
/// seconds out; new output before the timer fires resets it. Stops and
/// shutdown flush immediately.
///
/// `schedule` is callable from the pane read loop's blocking thread, so the
/// runtime handle is captured at construction instead of relying on an
/// ambient task context.
pub struct ScrollbackSaver {
    manager: Arc<SessionManager>,
    handle: Handle,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ScrollbackSaver {
    /// Must be created from within the runtime that will run the timers.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            handle: Handle::current(),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// (Re)arms the save timer for a session.
    pub fn schedule(&self, session_id: &str) {
        let Ok(mut timers) = self.timers.lock() else {
            warn!(session_id, "saver timer table poisoned, skipping schedule");
            return;
        };
        if let Some(previous) = timers.remove(session_id) {
            previous.abort();
        }
        let manager = Arc::clone(&self.manager);
        let id = session_id.to_string();
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            flush_session(&manager, &id);
        });
        timers.insert(session_id.to_string(), timer);
    }

    /// Cancels any pending timer and saves right now. The save itself runs
    /// even when the timer table is unusable.
    pub fn flush(&self, session_id: &str) {
        if let Ok(mut timers) = self.timers.lock()
            && let Some(timer) = timers.remove(session_id)
        {
            timer.abort();
        }
        flush_session(&self.manager, session_id);
    }
}

fn flush_session(manager: &SessionManager, session_id: &str) {
    let Some(session) = manager.get(session_id) else {
        return;
    };
    if session.update_cwd()
        && let Err(err) = manager.save_session(&session)
    {
        warn!(session_id, error = %err, "failed to save session metadata");
    }
    if let Err(err) = manager.save_scrollback(&session) {
        warn!(session_id, error = %err, "failed to save scrollback");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_session(manager: &SessionManager) -> String {
        let session = manager.create("demo", "/tmp").unwrap();
        session
            .ensure_main_pane()
            .unwrap()
            .hydrate_scrollback(b"burst".to_vec());
        session.id.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_fires_once_after_quiescence() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path()));
        let saver = ScrollbackSaver::new(Arc::clone(&manager));
        let id = seeded_session(&manager);
        let path = dir.path().join(format!("{id}.scrollback"));

        saver.schedule(&id);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!path.exists(), "save should still be pending");

        // A fresh burst resets the timer.
        saver.schedule(&id);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!path.exists(), "reset timer should not have fired yet");

        tokio::time::sleep(Duration::from_secs(3)).await;
        // Let the timer task run to completion.
        tokio::task::yield_now().await;
        assert!(path.exists(), "save should have fired after quiescence");
        assert_eq!(std::fs::read(&path).unwrap(), b"burst");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_saves_immediately_and_cancels_the_timer() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(dir.path()));
        let saver = ScrollbackSaver::new(Arc::clone(&manager));
        let id = seeded_session(&manager);
        let path = dir.path().join(format!("{id}.scrollback"));

        saver.schedule(&id);
        saver.flush(&id);
        assert!(path.exists());
    }
}
