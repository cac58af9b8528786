use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::watch;
use tracing::debug;

use crate::agent;
use crate::agent::AgentStatus;
use crate::error::PaneError;
use crate::scrollback::ScrollbackBuffer;
use crate::status::Status;
use crate::tracker::StateTracker;

/// The interactive agent CLI and the flag used to reattach to one of its
/// previous sessions.
pub const AGENT_CLI: &str = "claude";
pub const AGENT_RESUME_FLAG: &str = "--resume";

const DEFAULT_SHELL: &str = "/bin/zsh";
const READ_CHUNK_BYTES: usize = 4096;
const MONITOR_TICK: Duration = Duration::from_secs(1);
/// Confidence assigned to transcript-oracle overrides.
const ORACLE_CONFIDENCE: f64 = 0.95;

pub type OutputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// The smallest runtime unit: one child process attached to one PTY.
///
/// A pane is either inactive (no child, no PTY) or running. A running pane
/// owns the child, the PTY master, a blocking read loop and a 1 Hz status
/// monitor. `stop` is the universal cancellation signal; a stopped pane must
/// be `reset` before it can be started again.
pub struct Pane {
    pub id: String,
    pub created_at: DateTime<Utc>,
    state: Arc<RwLock<PaneState>>,
}

struct PaneState {
    directory: String,
    status: Status,
    scrollback: ScrollbackBuffer,
    tracker: StateTracker,
    child_pid: Option<u32>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    master: Option<Arc<StdMutex<Box<dyn MasterPty + Send>>>>,
    writer: Option<Arc<StdMutex<Box<dyn Write + Send>>>>,
    on_output: Option<OutputCallback>,
    on_status: Option<StatusCallback>,
    done: watch::Sender<bool>,
}

impl PaneState {
    fn new(directory: String) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            directory,
            status: Status::Idle,
            scrollback: ScrollbackBuffer::new(),
            tracker: StateTracker::new(),
            child_pid: None,
            killer: None,
            master: None,
            writer: None,
            on_output: None,
            on_status: None,
            done,
        }
    }

    fn release_child(&mut self) {
        if let Some(mut killer) = self.killer.take() {
            let _ = killer.kill();
        }
        self.child_pid = None;
        self.master = None;
        self.writer = None;
        let _ = self.done.send(true);
    }
}

impl Pane {
    pub fn new(id: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            state: Arc::new(RwLock::new(PaneState::new(directory.into()))),
        }
    }

    /// Launches the user's login shell in this pane.
    pub fn start(
        &self,
        rows: u16,
        cols: u16,
        on_output: OutputCallback,
        on_status: StatusCallback,
    ) -> Result<(), PaneError> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.to_string());
        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-l");
        self.spawn(cmd, rows, cols, Status::Shell, false, on_output, on_status)
    }

    /// Reattaches a previous agent session in this pane.
    pub fn resume(
        &self,
        agent_session_id: &str,
        rows: u16,
        cols: u16,
        on_output: OutputCallback,
        on_status: StatusCallback,
    ) -> Result<(), PaneError> {
        let mut cmd = CommandBuilder::new(AGENT_CLI);
        cmd.arg(AGENT_RESUME_FLAG);
        cmd.arg(agent_session_id);
        self.spawn(
            cmd,
            rows,
            cols,
            Status::WaitingInput,
            true,
            on_output,
            on_status,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        mut cmd: CommandBuilder,
        rows: u16,
        cols: u16,
        initial_status: Status,
        agent: bool,
        on_output: OutputCallback,
        on_status: StatusCallback,
    ) -> Result<(), PaneError> {
        let mut state = self.state.write().map_err(|_| PaneError::Poisoned)?;
        if state.killer.is_some() || state.status != Status::Idle {
            return Err(PaneError::AlreadyRunning);
        }

        cmd.cwd(&state.directory);
        cmd.env("TERM", "xterm-256color");
        cmd.env("LANG", "en_US.UTF-8");
        cmd.env("LC_ALL", "en_US.UTF-8");

        debug!(
            pane_id = %self.id,
            directory = %state.directory,
            rows,
            cols,
            "starting pane child"
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                state.status = Status::Error;
                PaneError::spawn(err)
            })?;

        let mut child = pair.slave.spawn_command(cmd).map_err(|err| {
            state.status = Status::Error;
            PaneError::spawn(err)
        })?;

        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader().map_err(|err| {
            let _ = child.kill();
            state.status = Status::Error;
            PaneError::spawn(err)
        })?;
        let writer = pair.master.take_writer().map_err(|err| {
            let _ = child.kill();
            state.status = Status::Error;
            PaneError::spawn(err)
        })?;

        state.child_pid = child.process_id();
        state.killer = Some(killer);
        state.master = Some(Arc::new(StdMutex::new(pair.master)));
        state.writer = Some(Arc::new(StdMutex::new(writer)));
        state.status = initial_status;
        state.on_output = Some(on_output);
        state.on_status = Some(on_status);

        let now = Instant::now();
        state.tracker.last_output_time = Some(now);
        state.tracker.state_changed_at = now;
        if agent {
            state.tracker.mark_agent_active();
        }

        let (done_tx, done_rx) = watch::channel(false);
        state.done = done_tx;

        // Reap the child so it never lingers as a zombie.
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
        });

        let id = self.id.clone();
        let shared = Arc::clone(&self.state);
        let loop_done = done_rx.clone();
        tokio::task::spawn_blocking(move || read_loop(id, shared, reader, loop_done));

        let id = self.id.clone();
        let shared = Arc::clone(&self.state);
        tokio::spawn(monitor(id, shared, done_rx));

        Ok(())
    }

    /// Forwards input bytes to the PTY. The PTY reference is snapshotted
    /// under the lock and the syscall performed outside it.
    pub fn write(&self, data: &[u8]) -> Result<usize, PaneError> {
        let writer = {
            let mut state = self.state.write().map_err(|_| PaneError::Poisoned)?;
            state.tracker.record_input(Instant::now());
            state.writer.clone().ok_or(PaneError::Closed)?
        };
        let mut guard = writer.lock().map_err(|_| PaneError::Poisoned)?;
        guard
            .write_all(data)
            .map_err(|error| PaneError::Write { error })?;
        guard.flush().map_err(|error| PaneError::Write { error })?;
        Ok(data.len())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PaneError> {
        let master = {
            let state = self.state.read().map_err(|_| PaneError::Poisoned)?;
            state.master.clone().ok_or(PaneError::Closed)?
        };
        let guard = master.lock().map_err(|_| PaneError::Poisoned)?;
        guard
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PaneError::resize)
    }

    /// Kills the child, closes the PTY and signals `done`. Idempotent; the
    /// read loop and monitor observe the signal and exit. Does not fire the
    /// status callback — callers decide whether a stop is worth announcing.
    pub fn stop(&self) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.release_child();
        state.status = Status::Stopped;
    }

    /// Returns the pane to inactive: child gone, scrollback and tracker
    /// dropped, callbacks cleared. After a reset the pane may be started
    /// again; this is the only operation that clears the sticky agent flag.
    pub fn reset(&self) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.release_child();
        state.scrollback.clear();
        state.tracker = StateTracker::new();
        state.on_output = None;
        state.on_status = None;
        state.status = Status::Idle;
        let (done, _) = watch::channel(false);
        state.done = done;
    }

    /// A poisoned pane reads as errored rather than taking the process down.
    pub fn status(&self) -> Status {
        self.state.read().map(|s| s.status).unwrap_or(Status::Error)
    }

    pub fn is_running(&self) -> bool {
        self.state.read().map(|s| s.killer.is_some()).unwrap_or(false)
    }

    pub fn directory(&self) -> String {
        self.state
            .read()
            .map(|s| s.directory.clone())
            .unwrap_or_default()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.state.read().ok().and_then(|s| s.child_pid)
    }

    /// Independent copy of the retained terminal history.
    pub fn scrollback(&self) -> Vec<u8> {
        self.state
            .read()
            .map(|s| s.scrollback.snapshot())
            .unwrap_or_default()
    }

    /// Loads previously persisted history, e.g. at startup.
    pub fn hydrate_scrollback(&self, data: Vec<u8>) {
        if let Ok(mut state) = self.state.write() {
            state.scrollback.replace(data);
        }
    }

    /// Best-effort lookup of the child's current working directory, falling
    /// back to the pane's configured directory.
    pub fn process_cwd(&self) -> String {
        let (pid, directory) = match self.state.read() {
            Ok(state) => (state.child_pid, state.directory.clone()),
            Err(_) => return String::new(),
        };
        pid.and_then(process_cwd_by_pid).unwrap_or(directory)
    }
}

#[cfg(target_os = "linux")]
fn process_cwd_by_pid(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
}

#[cfg(target_os = "macos")]
fn process_cwd_by_pid(pid: u32) -> Option<String> {
    let output = std::process::Command::new("lsof")
        .args(["-a", "-d", "cwd", "-p", &pid.to_string(), "-Fn"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines()
        .find(|line| line.len() > 1 && line.starts_with('n'))
        .map(|line| line[1..].to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn process_cwd_by_pid(_pid: u32) -> Option<String> {
    None
}

/// Blocking read loop: reads up to 4 KiB per iteration, carries incomplete
/// UTF-8 tails into the next chunk, then appends to scrollback, feeds the
/// tracker and fans out via the output callback. A read error or EOF is the
/// natural end of the child's lifetime and produces a single stopped status.
fn read_loop(
    id: String,
    state: Arc<RwLock<PaneState>>,
    mut reader: Box<dyn Read + Send>,
    done: watch::Receiver<bool>,
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        if *done.borrow() {
            debug!(pane_id = %id, "read loop observed done signal");
            return;
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => {
                mark_stopped(&id, &state);
                return;
            }
            Ok(n) => n,
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(pane_id = %id, error = %err, "pty read ended");
                mark_stopped(&id, &state);
                return;
            }
        };

        let mut data = std::mem::take(&mut pending);
        data.extend_from_slice(&buf[..n]);

        let valid = utf8_boundary(&data);
        if valid < data.len() {
            pending = data.split_off(valid);
        }
        if data.is_empty() {
            continue;
        }

        let (decision, on_output, on_status) = {
            let Ok(mut guard) = state.write() else {
                return;
            };
            guard.scrollback.append(&data);
            let current = guard.status;
            let text = String::from_utf8_lossy(&data).into_owned();
            let decision = guard
                .tracker
                .observe_output(&text, current, Instant::now());
            if let Some((status, confidence)) = decision {
                debug!(
                    pane_id = %id,
                    from = %current,
                    to = %status,
                    confidence,
                    "state transition"
                );
                guard.status = status;
            }
            (decision, guard.on_output.clone(), guard.on_status.clone())
        };

        if let Some((status, _)) = decision
            && let Some(cb) = on_status.as_ref()
        {
            cb(status);
        }
        if let Some(cb) = on_output.as_ref() {
            cb(&data);
        }
    }
}

/// Transitions to stopped on behalf of a dying read loop, announcing the
/// change at most once even when racing an explicit `stop`. Also releases
/// the child resources and signals `done` so the monitor terminates after a
/// natural exit, not just an explicit stop.
fn mark_stopped(id: &str, state: &Arc<RwLock<PaneState>>) {
    let on_status = {
        let Ok(mut guard) = state.write() else {
            return;
        };
        if guard.status == Status::Stopped {
            return;
        }
        guard.release_child();
        guard.status = Status::Stopped;
        guard.on_status.clone()
    };
    debug!(pane_id = %id, "pane child ended");
    if let Some(cb) = on_status {
        cb(Status::Stopped);
    }
}

/// Returns the length of the longest prefix that does not end in the middle
/// of a multi-byte UTF-8 sequence. The remainder must be carried into the
/// next chunk; terminal emulators corrupt their display on a bare start
/// byte.
fn utf8_boundary(data: &[u8]) -> usize {
    let n = data.len();
    for i in 1..=3.min(n) {
        let b = data[n - i];
        if b & 0x80 == 0 {
            return n;
        }
        if b & 0xC0 == 0xC0 {
            let expected = if b & 0xE0 == 0xC0 {
                2
            } else if b & 0xF0 == 0xE0 {
                3
            } else if b & 0xF8 == 0xF0 {
                4
            } else {
                0
            };
            if i < expected {
                return n - i;
            }
            return n;
        }
    }
    n
}

/// 1 Hz status monitor: consults the transcript oracle while an agent is
/// active, then applies the wall-clock timeout rules.
async fn monitor(id: String, state: Arc<RwLock<PaneState>>, mut done: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(MONITOR_TICK);
    loop {
        tokio::select! {
            changed = done.changed() => {
                let _ = changed;
                debug!(pane_id = %id, "monitor observed done signal");
                return;
            }
            _ = ticker.tick() => {
                poll_agent_transcript(&id, &state).await;
                check_timeouts(&id, &state);
            }
        }
    }
}

/// When the pane hosts an agent, the transcript on disk is the source of
/// truth; its verdict overrides the byte-stream heuristics at 0.95.
async fn poll_agent_transcript(id: &str, state: &Arc<RwLock<PaneState>>) {
    let (agent_active, directory, old_status) = {
        let Ok(guard) = state.read() else {
            return;
        };
        (
            guard.tracker.is_agent_active(),
            guard.directory.clone(),
            guard.status,
        )
    };
    if !agent_active || old_status.is_settled() {
        return;
    }

    let oracle = tokio::task::spawn_blocking(move || agent::get_state(&directory)).await;
    let Ok(oracle_state) = oracle else {
        return;
    };

    let new_status = match oracle_state.status {
        AgentStatus::Thinking => Status::Thinking,
        AgentStatus::Executing => Status::Executing,
        AgentStatus::WaitingInput => Status::WaitingInput,
        // The agent session may have ended; treat it as ready for input.
        AgentStatus::Idle => Status::WaitingInput,
    };

    if new_status == old_status {
        return;
    }

    let on_status = {
        let Ok(mut guard) = state.write() else {
            return;
        };
        if guard.status != old_status {
            return;
        }
        guard.status = new_status;
        guard.tracker.apply_override(ORACLE_CONFIDENCE, Instant::now());
        guard.on_status.clone()
    };

    debug!(
        pane_id = %id,
        from = %old_status,
        to = %new_status,
        tool = oracle_state.current_tool.as_deref().unwrap_or(""),
        "transcript override"
    );

    if let Some(cb) = on_status {
        cb(new_status);
    }
}

fn check_timeouts(id: &str, state: &Arc<RwLock<PaneState>>) {
    let (decision, on_status) = {
        let Ok(mut guard) = state.write() else {
            return;
        };
        let current = guard.status;
        let decision = guard.tracker.check_timeouts(current, Instant::now());
        if let Some((status, confidence)) = decision {
            debug!(
                pane_id = %id,
                from = %current,
                to = %status,
                confidence,
                "timeout transition"
            );
            guard.status = status;
        }
        (decision, guard.on_status.clone())
    };

    if let Some((status, _)) = decision
        && let Some(cb) = on_status
    {
        cb(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn utf8_boundary_carries_incomplete_two_byte_start() {
        // 0xC3 opens a two-byte sequence; its continuation has not arrived.
        assert_eq!(utf8_boundary(&[b'a', b'b', 0xC3]), 2);
        // With the continuation present the whole chunk is emittable.
        assert_eq!(utf8_boundary(&[b'a', b'b', 0xC3, 0xA9]), 4);
    }

    #[test]
    fn utf8_boundary_handles_three_and_four_byte_sequences() {
        // "€" is E2 82 AC.
        assert_eq!(utf8_boundary(&[0xE2]), 0);
        assert_eq!(utf8_boundary(&[0xE2, 0x82]), 0);
        assert_eq!(utf8_boundary(&[0xE2, 0x82, 0xAC]), 3);
        // Four-byte start missing its tail.
        assert_eq!(utf8_boundary(&[b'x', 0xF0, 0x9F, 0x98]), 1);
        assert_eq!(utf8_boundary(&[0xF0, 0x9F, 0x98, 0x80]), 4);
    }

    #[test]
    fn utf8_boundary_ascii_passes_through() {
        assert_eq!(utf8_boundary(b"plain ascii"), 11);
        assert_eq!(utf8_boundary(&[]), 0);
    }

    #[test]
    fn write_on_inactive_pane_is_closed() {
        let pane = Pane::new("p1", "/tmp");
        assert!(matches!(pane.write(b"x"), Err(PaneError::Closed)));
        assert!(matches!(pane.resize(24, 80), Err(PaneError::Closed)));
    }

    #[test]
    fn stop_on_inactive_pane_is_a_no_op() {
        let pane = Pane::new("p1", "/tmp");
        pane.stop();
        pane.stop();
        assert_eq!(pane.status(), Status::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_echo_stop_round_trip() {
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();
        let on_output: OutputCallback = Arc::new(move |data| {
            let _ = out_tx.send(data.to_vec());
        });
        let on_status: StatusCallback = Arc::new(|_| {});

        // A plain sh keeps the test independent of the invoking user's shell.
        unsafe { std::env::set_var("SHELL", "/bin/sh") };
        let pane = Pane::new("p1", "/tmp");
        pane.start(24, 80, on_output, on_status).expect("start");
        assert_eq!(pane.status(), Status::Shell);
        assert!(pane.is_running());

        pane.write(b"echo claudex-roundtrip\n").expect("write");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok(chunk) = out_rx.recv_timeout(Duration::from_millis(200)) {
                seen.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&seen).contains("claudex-roundtrip") {
                    break;
                }
            }
        }
        assert!(
            String::from_utf8_lossy(&seen).contains("claudex-roundtrip"),
            "expected echoed output, got: {:?}",
            String::from_utf8_lossy(&seen)
        );
        assert!(!pane.scrollback().is_empty());

        pane.stop();
        assert_eq!(pane.status(), Status::Stopped);
        // Second stop stays a no-op.
        pane.stop();
        assert_eq!(pane.status(), Status::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn natural_child_exit_releases_the_pane() {
        let (status_tx, status_rx) = mpsc::channel::<Status>();
        let on_output: OutputCallback = Arc::new(|_| {});
        let on_status: StatusCallback = Arc::new(move |status| {
            let _ = status_tx.send(status);
        });

        unsafe { std::env::set_var("SHELL", "/bin/sh") };
        let pane = Pane::new("p1", "/tmp");
        pane.start(24, 80, on_output, on_status).expect("start");
        pane.write(b"exit\n").expect("write");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_stopped = false;
        while Instant::now() < deadline {
            if let Ok(status) = status_rx.recv_timeout(Duration::from_millis(200))
                && status == Status::Stopped
            {
                saw_stopped = true;
                break;
            }
        }
        assert!(saw_stopped, "expected a stopped notification");
        assert_eq!(pane.status(), Status::Stopped);
        // The child's end must release the PTY and signal done, exactly as
        // an explicit stop would.
        assert!(!pane.is_running());
        assert!(matches!(pane.write(b"x"), Err(PaneError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reset_then_start_gets_a_fresh_child() {
        let on_output: OutputCallback = Arc::new(|_| {});
        let on_status: StatusCallback = Arc::new(|_| {});

        unsafe { std::env::set_var("SHELL", "/bin/sh") };
        let pane = Pane::new("p1", "/tmp");
        pane.start(24, 80, on_output.clone(), on_status.clone())
            .expect("first start");
        let first_pid = pane.child_pid().expect("pid");

        // A running pane cannot be started in place.
        assert!(matches!(
            pane.start(24, 80, on_output.clone(), on_status.clone()),
            Err(PaneError::AlreadyRunning)
        ));

        pane.stop();
        pane.reset();
        assert_eq!(pane.status(), Status::Idle);
        assert!(pane.scrollback().is_empty());

        pane.start(24, 80, on_output, on_status).expect("restart");
        let second_pid = pane.child_pid().expect("pid");
        assert_ne!(first_pid, second_pid);
        pane.stop();
    }
}
