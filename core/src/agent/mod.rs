//! Read-only oracle over the agent CLI's on-disk transcripts.
//!
//! The agent writes a JSONL transcript per session under
//! `~/.claude/projects/<encoded-path>/`, plus a `sessions-index.json`
//! summarizing them. The tracker's high-confidence override and the resume
//! decision both treat these files as the source of truth; everything here
//! is a pure function of the filesystem.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Sessions older than this are considered abandoned.
const STALE_AFTER_SECS: i64 = 5 * 60;
/// Completed tools retained for display.
const RECENT_TOOLS_KEPT: usize = 5;

#[derive(Debug, Clone, Deserialize)]
struct SessionIndex {
    #[serde(default)]
    entries: Vec<AgentSessionEntry>,
}

/// One entry of the agent's per-project session index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionEntry {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub full_path: String,
    #[serde(default)]
    pub file_mtime: i64,
    #[serde(default)]
    pub first_prompt: String,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub modified: String,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub is_sidechain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    Executing,
    WaitingInput,
}

/// Snapshot of an agent session's activity derived from its transcript.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub tokens_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub pending_tools: Vec<ToolInfo>,
    pub recent_tools: Vec<ToolInfo>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptLine {
    #[serde(default)]
    cwd: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: TranscriptMessage,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
struct TranscriptMessage {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default)]
    tool_use_id: String,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// The agent encodes a project path by replacing `/` with `-`.
pub fn project_dir(work_dir: &str) -> PathBuf {
    let encoded = work_dir.replace('/', "-");
    dirs::home_dir()
        .unwrap_or_default()
        .join(".claude")
        .join("projects")
        .join(encoded)
}

/// The most recently modified agent session recorded for `work_dir`, if any.
pub fn find_active_session(work_dir: &str) -> Option<AgentSessionEntry> {
    let index_path = project_dir(work_dir).join("sessions-index.json");
    let data = std::fs::read_to_string(index_path).ok()?;
    let index: SessionIndex = serde_json::from_str(&data).ok()?;
    index
        .entries
        .into_iter()
        .max_by_key(|entry| entry.file_mtime)
}

/// Reads the active session's transcript and derives the agent's current
/// state. Absent or unreadable transcripts yield an idle state; this
/// function never fails.
pub fn get_state(work_dir: &str) -> AgentState {
    let Some(session) = find_active_session(work_dir) else {
        return AgentState::default();
    };
    let Ok(mut state) = parse_transcript(Path::new(&session.full_path)) else {
        return AgentState::default();
    };
    state.session_id = Some(session.session_id);
    if !session.git_branch.is_empty() {
        state.git_branch = Some(session.git_branch);
    }
    state
}

fn parse_transcript(path: &Path) -> std::io::Result<AgentState> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut state = AgentState::default();
    let mut pending: HashMap<String, ToolInfo> = HashMap::new();
    let mut pending_order: Vec<String> = Vec::new();
    let mut recent: Vec<ToolInfo> = Vec::new();
    let mut last_kind = String::new();
    let mut last_stop_reason: Option<String> = None;
    let mut last_had_thinking = false;
    let mut total_tokens: u64 = 0;

    for line in reader.lines() {
        let line = line?;
        let Ok(entry) = serde_json::from_str::<TranscriptLine>(&line) else {
            continue;
        };

        if !entry.cwd.is_empty() {
            state.cwd = Some(entry.cwd.clone());
        }
        if !entry.message.model.is_empty() {
            state.model = Some(entry.message.model.clone());
        }
        if let Some(usage) = &entry.message.usage {
            total_tokens += usage.input_tokens + usage.output_tokens;
        }

        last_kind = entry.kind.clone();
        last_stop_reason = entry.message.stop_reason.clone();
        last_had_thinking = entry
            .message
            .content
            .iter()
            .any(|block| block.kind == "thinking");
        if !entry.timestamp.is_empty() {
            state.last_activity = Some(entry.timestamp.clone());
        }

        for block in &entry.message.content {
            match block.kind.as_str() {
                "tool_use" => {
                    let info = ToolInfo {
                        id: block.id.clone(),
                        name: block.name.clone(),
                        target: extract_tool_target(&block.name, &block.input),
                        status: "running".to_string(),
                        start_time: Some(entry.timestamp.clone()),
                        end_time: None,
                    };
                    if !pending.contains_key(&block.id) {
                        pending_order.push(block.id.clone());
                    }
                    pending.insert(block.id.clone(), info);
                }
                "tool_result" => {
                    if let Some(mut info) = pending.remove(&block.tool_use_id) {
                        pending_order.retain(|id| id != &block.tool_use_id);
                        info.end_time = Some(entry.timestamp.clone());
                        info.status = if block.is_error {
                            "error".to_string()
                        } else {
                            "completed".to_string()
                        };
                        recent.push(info);
                    }
                }
                _ => {}
            }
        }
    }

    state.tokens_used = total_tokens;
    if recent.len() > RECENT_TOOLS_KEPT {
        recent.drain(..recent.len() - RECENT_TOOLS_KEPT);
    }
    state.recent_tools = recent;
    state.pending_tools = pending_order
        .iter()
        .filter_map(|id| pending.get(id).cloned())
        .collect();

    state.status = if let Some(first) = state.pending_tools.first() {
        state.current_tool = Some(first.name.clone());
        state.tool_target = first.target.clone();
        AgentStatus::Executing
    } else if last_kind == "assistant" {
        if last_had_thinking {
            AgentStatus::Thinking
        } else if last_stop_reason.as_deref() == Some("end_turn") {
            AgentStatus::WaitingInput
        } else {
            AgentStatus::Thinking
        }
    } else if last_kind == "user" {
        AgentStatus::Thinking
    } else {
        AgentStatus::Idle
    };

    // A transcript with no fresh activity belongs to an abandoned session.
    if let Some(last_activity) = &state.last_activity
        && let Ok(at) = DateTime::parse_from_rfc3339(last_activity)
        && (Utc::now() - at.with_timezone(&Utc)).num_seconds() > STALE_AFTER_SECS
    {
        state.status = AgentStatus::Idle;
    }

    Ok(state)
}

/// A short human-readable description of what a tool call targets.
fn extract_tool_target(tool_name: &str, input: &serde_json::Value) -> Option<String> {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match tool_name {
        "Read" | "Write" | "Edit" => field("file_path").map(|path| {
            Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string())
        }),
        "Bash" => field("command").map(|cmd| {
            if cmd.len() > 50 {
                let cut = cmd
                    .char_indices()
                    .take_while(|(i, _)| *i < 50)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                format!("{}...", &cmd[..cut])
            } else {
                cmd.to_string()
            }
        }),
        "Glob" | "Grep" => field("pattern").map(str::to_string),
        "Task" => field("description").map(str::to_string),
        "WebFetch" => field("url").map(str::to_string),
        _ => None,
    }
}
