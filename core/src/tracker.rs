use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use crate::status::Status;

/// Ring capacity for recently observed lines.
const MAX_LINES: usize = 50;
/// Window inspected by the highest-priority per-chunk rules.
const RECENT_LINES: usize = 5;
/// Rolling window for the output-rate estimate.
const IO_WINDOW: Duration = Duration::from_secs(2);
/// Output rate above which the pane is assumed to be executing a tool.
const EXECUTING_RATE_BYTES_PER_SEC: f64 = 1000.0;

const THINKING_TIMEOUT: Duration = Duration::from_secs(60);
const EXECUTING_TIMEOUT: Duration = Duration::from_secs(300);
const INPUT_TO_THINKING_DELAY: Duration = Duration::from_millis(500);
const INPUT_TO_THINKING_WINDOW: Duration = Duration::from_secs(5);

const SPINNER_CHARS: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

const TOOL_PATTERNS: &[&str] = &[
    "Reading",
    "Writing",
    "Executing",
    "Searching",
    "── Edit",
    "── Bash",
    "── Read",
    "── Glob",
    "── Grep",
    "── Task",
    "── Write",
    "── WebFetch",
    "── WebSearch",
    "── LSP",
    "✓ Edit",
    "✓ Bash",
    "✓ Read",
    "✓ Write",
    "⠋ Edit",
    "⠋ Bash",
    "⠋ Read",
    "⠋ Task",
];

const AGENT_UI_PATTERNS: &[&str] = &[
    "╭─",
    "╰─",
    "│ ",
    "Claude Code",
    "claude>",
    "cost:",
    "tokens:",
    "Tool Result",
    "Tool Call",
];

/// One decoded output line with its features computed once at ingest.
#[derive(Debug, Clone)]
pub struct LineEntry {
    pub content: String,
    pub at: Instant,
    pub has_spinner: bool,
    pub has_tool_pattern: bool,
    pub has_agent_ui: bool,
    pub has_shell_prompt: bool,
}

impl LineEntry {
    fn new(content: &str, at: Instant) -> Self {
        Self {
            content: content.to_string(),
            at,
            has_spinner: detect_spinner(content),
            has_tool_pattern: detect_tool_pattern(content),
            has_agent_ui: detect_agent_ui(content),
            has_shell_prompt: detect_shell_prompt(content),
        }
    }
}

/// Per-pane classifier mapping the output byte stream plus timing into a
/// status with a confidence score.
///
/// `agent_active` is sticky: once agent UI has been observed, shell prompts
/// appearing inside the agent's tool output are treated as false positives
/// and never transition the pane back to shell. Only a pane reset clears it.
#[derive(Debug)]
pub struct StateTracker {
    pub(crate) last_input_time: Option<Instant>,
    pub(crate) last_output_time: Option<Instant>,
    pub(crate) state_changed_at: Instant,
    pub(crate) confidence: f64,
    output_bytes: u64,
    output_window_start: Instant,
    output_rate: f64,
    lines: VecDeque<LineEntry>,
    pub(crate) agent_active: bool,
}

impl StateTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_input_time: None,
            last_output_time: None,
            state_changed_at: now,
            confidence: 0.0,
            output_bytes: 0,
            output_window_start: now,
            output_rate: 0.0,
            lines: VecDeque::with_capacity(MAX_LINES),
            agent_active: false,
        }
    }

    pub fn record_input(&mut self, now: Instant) {
        self.last_input_time = Some(now);
    }

    pub fn mark_agent_active(&mut self) {
        self.agent_active = true;
    }

    pub fn is_agent_active(&self) -> bool {
        self.agent_active
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Records an externally supplied classification, e.g. the transcript
    /// oracle override or the timeout monitor's decision.
    pub fn apply_override(&mut self, confidence: f64, now: Instant) {
        self.state_changed_at = now;
        self.confidence = confidence;
    }

    /// Classifies a freshly emitted output chunk. Returns the new status and
    /// its confidence when the pane should transition; `None` means hold the
    /// current status (the confidence is still refreshed).
    pub fn observe_output(
        &mut self,
        data: &str,
        current: Status,
        now: Instant,
    ) -> Option<(Status, f64)> {
        self.last_output_time = Some(now);
        self.update_io_rate(data.len() as u64, now);
        self.ingest_lines(data, now);

        let (status, confidence) = self.analyze_state(current, now);
        if status != current && (confidence >= 0.6 || is_strong_transition(current, status)) {
            self.state_changed_at = now;
            self.confidence = confidence;
            return Some((status, confidence));
        }
        self.confidence = confidence;
        None
    }

    /// Timeout rules evaluated once per monitor tick. Never acts on settled
    /// states; the monitor does not call this for them either.
    pub fn check_timeouts(&mut self, current: Status, now: Instant) -> Option<(Status, f64)> {
        if current.is_settled() {
            return None;
        }

        let since_output = self
            .last_output_time
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO);
        let since_state_change = now.duration_since(self.state_changed_at);

        let decision = match current {
            Status::Thinking if since_output > THINKING_TIMEOUT => {
                Some((Status::WaitingInput, 0.6))
            }
            Status::Executing if since_state_change > EXECUTING_TIMEOUT => {
                Some((Status::WaitingInput, 0.5))
            }
            Status::Shell | Status::WaitingInput => {
                let fresh_input = self.last_input_time.is_some_and(|input| {
                    let since_input = now.duration_since(input);
                    since_input > INPUT_TO_THINKING_DELAY
                        && since_input < INPUT_TO_THINKING_WINDOW
                        && self.last_output_time.is_none_or(|output| input > output)
                });
                if fresh_input && self.agent_active {
                    Some((Status::Thinking, 0.7))
                } else {
                    None
                }
            }
            _ => None,
        };

        if let Some((status, confidence)) = decision {
            self.state_changed_at = now;
            self.confidence = confidence;
            return Some((status, confidence));
        }
        None
    }

    fn update_io_rate(&mut self, bytes: u64, now: Instant) {
        if now.duration_since(self.output_window_start) > IO_WINDOW {
            self.output_rate = self.output_bytes as f64 / IO_WINDOW.as_secs_f64();
            self.output_bytes = 0;
            self.output_window_start = now;
        }
        self.output_bytes += bytes;
    }

    fn ingest_lines(&mut self, data: &str, now: Instant) {
        for line in data.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            if self.lines.len() == MAX_LINES {
                self.lines.pop_front();
            }
            self.lines.push_back(LineEntry::new(line, now));
        }
    }

    /// Hybrid classification cascade over the freshest evidence first.
    fn analyze_state(&mut self, current: Status, now: Instant) -> (Status, f64) {
        let recent = self.lines.iter().rev().take(RECENT_LINES);
        let mut recent_spinner = false;
        let mut recent_tool = false;
        for line in recent {
            recent_spinner |= line.has_spinner;
            recent_tool |= line.has_tool_pattern;
        }

        if recent_spinner {
            self.mark_agent_active();
            return (Status::Thinking, 0.95);
        }
        if recent_tool {
            self.mark_agent_active();
            return (Status::Executing, 0.90);
        }

        let (context_status, context_conf) = self.analyze_context();
        if context_conf >= 0.8 {
            return (context_status, context_conf);
        }

        let (io_status, io_conf) = self.analyze_io_behavior(current, now);
        if io_conf >= 0.7 {
            return (io_status, io_conf);
        }

        if context_conf >= 0.5 && io_conf >= 0.5 && context_status == io_status {
            return (context_status, (context_conf + io_conf) / 2.0);
        }

        if context_conf >= 0.5 {
            return (context_status, context_conf);
        }

        (current, 0.4)
    }

    /// Feature counting over the full line ring.
    fn analyze_context(&mut self) -> (Status, f64) {
        if self.lines.is_empty() {
            if self.agent_active {
                return (Status::WaitingInput, 0.5);
            }
            return (Status::Shell, 0.3);
        }

        let mut spinner_count = 0usize;
        let mut tool_count = 0usize;
        let mut agent_ui_count = 0usize;
        let mut shell_prompt_count = 0usize;
        let mut last_agent_ui: Option<usize> = None;
        let mut last_shell_prompt: Option<usize> = None;

        for (i, line) in self.lines.iter().enumerate() {
            if line.has_spinner {
                spinner_count += 1;
            }
            if line.has_tool_pattern {
                tool_count += 1;
            }
            if line.has_agent_ui {
                agent_ui_count += 1;
                last_agent_ui = Some(i);
            }
            if line.has_shell_prompt {
                shell_prompt_count += 1;
                last_shell_prompt = Some(i);
            }
        }

        if spinner_count > 0 {
            self.mark_agent_active();
            return (Status::Thinking, 0.85);
        }
        if tool_count > 0 {
            self.mark_agent_active();
            return (Status::Executing, 0.80);
        }

        let last_line_is_prompt = self
            .lines
            .back()
            .is_some_and(|line| looks_like_agent_prompt(&line.content));

        // Once an agent has been observed, a shell prompt in the window is a
        // known false positive (it appears inside tool output); refuse to
        // return to shell.
        if self.agent_active {
            if agent_ui_count > 0 && last_line_is_prompt {
                return (Status::WaitingInput, 0.85);
            }
            return (Status::WaitingInput, 0.70);
        }

        if agent_ui_count > 0 && last_agent_ui > last_shell_prompt {
            self.mark_agent_active();
            if last_line_is_prompt {
                return (Status::WaitingInput, 0.85);
            }
            return (Status::WaitingInput, 0.70);
        }

        if shell_prompt_count > 0 && last_shell_prompt > last_agent_ui {
            return (Status::Shell, 0.80);
        }

        (Status::Shell, 0.50)
    }

    /// Inference from output velocity and input/output timing alone.
    fn analyze_io_behavior(&self, current: Status, now: Instant) -> (Status, f64) {
        if self.output_rate > EXECUTING_RATE_BYTES_PER_SEC {
            return (Status::Executing, 0.75);
        }

        if let Some(input) = self.last_input_time
            && now.duration_since(input) < Duration::from_secs(10)
            && self.last_output_time.is_none_or(|output| input > output)
            && self.agent_active
        {
            return (Status::Thinking, 0.65);
        }

        let since_output = self
            .last_output_time
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO);
        if since_output > Duration::from_secs(5) && self.agent_active {
            return (Status::WaitingInput, 0.60);
        }

        (current, 0.3)
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Transitions whose direction is known to be correct whenever any evidence
/// supports them, allowed below the usual confidence gate.
fn is_strong_transition(from: Status, to: Status) -> bool {
    if from == Status::Shell
        && matches!(
            to,
            Status::Thinking | Status::Executing | Status::WaitingInput
        )
    {
        return true;
    }
    matches!(from, Status::Thinking | Status::Executing) && to == Status::WaitingInput
}

fn detect_spinner(line: &str) -> bool {
    line.chars().any(|c| SPINNER_CHARS.contains(&c))
}

fn detect_tool_pattern(line: &str) -> bool {
    TOOL_PATTERNS.iter().any(|p| line.contains(p))
}

fn detect_agent_ui(line: &str) -> bool {
    AGENT_UI_PATTERNS.iter().any(|p| line.contains(p))
}

fn detect_shell_prompt(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }

    if let Some(last) = line.chars().last()
        && matches!(last, '$' | '%' | '#')
    {
        return true;
    }

    if line.contains('❯') && !line.contains("Claude") {
        return true;
    }

    if line.contains('@')
        && (line.contains(':') || line.contains('~'))
        && !line.contains("Claude")
        && !line.contains('│')
    {
        return true;
    }

    false
}

fn looks_like_agent_prompt(line: &str) -> bool {
    let line = line.trim_end_matches(['\r']);
    let trimmed = line.trim();
    if trimmed.ends_with('>') || line.ends_with("> ") {
        return true;
    }
    line.contains("> ") && line.contains('│')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StateTracker {
        StateTracker::new()
    }

    #[test]
    fn spinner_line_means_thinking_with_high_confidence() {
        let mut t = tracker();
        let decision = t.observe_output("⠋ Pondering…\n", Status::Shell, Instant::now());
        assert_eq!(decision, Some((Status::Thinking, 0.95)));
        assert!(t.is_agent_active());
        assert_eq!(t.confidence(), 0.95);
    }

    #[test]
    fn tool_pattern_means_executing() {
        let mut t = tracker();
        let decision = t.observe_output("── Bash ls -la\n", Status::Shell, Instant::now());
        assert_eq!(decision, Some((Status::Executing, 0.90)));
        assert!(t.is_agent_active());
    }

    #[test]
    fn agent_active_refuses_to_return_to_shell() {
        let mut t = tracker();
        let now = Instant::now();
        t.mark_agent_active();
        let decision = t.observe_output("user@host:~/project $ \n", Status::WaitingInput, now);
        // The shell prompt is treated as a false positive inside tool
        // output: the tracker stays in an agent state.
        assert_eq!(decision, None);
        assert!(t.is_agent_active());
    }

    #[test]
    fn agent_prompt_shape_raises_waiting_input_confidence() {
        let mut t = tracker();
        let now = Instant::now();
        t.mark_agent_active();
        let decision = t.observe_output("╭────╮\n│ > │\n", Status::Thinking, now);
        assert_eq!(decision, Some((Status::WaitingInput, 0.85)));
    }

    #[test]
    fn shell_prompt_after_agent_ui_wins_when_agent_not_active() {
        let mut t = tracker();
        let now = Instant::now();
        let decision = t.observe_output("user@host:~ $\n", Status::Idle, now);
        assert_eq!(decision, Some((Status::Shell, 0.80)));
        assert!(!t.is_agent_active());
    }

    #[test]
    fn agent_ui_after_shell_prompt_flips_agent_active() {
        let mut t = tracker();
        let now = Instant::now();
        t.observe_output("user@host:~ $\n", Status::Shell, now);
        let decision = t.observe_output("╭─ Claude Code ─╮\n", Status::Shell, now);
        assert!(t.is_agent_active());
        let (status, _) = decision.expect("expected a transition");
        assert_eq!(status, Status::WaitingInput);
    }

    #[test]
    fn low_confidence_holds_current_status() {
        let mut t = tracker();
        // Ambiguous output with no prompt shape: context verdict is
        // (shell, 0.5) which matches neither gate from thinking, and the
        // transition thinking -> shell is not strong.
        let decision = t.observe_output("plain output text\n", Status::Thinking, Instant::now());
        assert_eq!(decision, None);
    }

    #[test]
    fn thinking_times_out_to_waiting_input_after_a_minute() {
        let mut t = tracker();
        let start = Instant::now();
        t.last_output_time = Some(start);
        t.state_changed_at = start;
        let now = start + Duration::from_secs(61);
        assert_eq!(
            t.check_timeouts(Status::Thinking, now),
            Some((Status::WaitingInput, 0.6))
        );
        // The transition reset state_changed_at, so a second tick does not
        // fire again from thinking rules.
        assert_eq!(t.check_timeouts(Status::WaitingInput, now), None);
    }

    #[test]
    fn executing_times_out_on_state_age_not_output_silence() {
        let mut t = tracker();
        let start = Instant::now();
        t.state_changed_at = start;
        t.last_output_time = Some(start + Duration::from_secs(299));
        let now = start + Duration::from_secs(301);
        assert_eq!(
            t.check_timeouts(Status::Executing, now),
            Some((Status::WaitingInput, 0.5))
        );
    }

    #[test]
    fn fresh_input_after_output_promotes_agent_to_thinking() {
        let mut t = tracker();
        let start = Instant::now();
        t.mark_agent_active();
        t.last_output_time = Some(start);
        t.record_input(start + Duration::from_secs(1));
        let now = start + Duration::from_secs(2);
        assert_eq!(
            t.check_timeouts(Status::WaitingInput, now),
            Some((Status::Thinking, 0.7))
        );
    }

    #[test]
    fn timeouts_never_act_on_settled_states() {
        let mut t = tracker();
        let now = Instant::now() + Duration::from_secs(3600);
        assert_eq!(t.check_timeouts(Status::Stopped, now), None);
        assert_eq!(t.check_timeouts(Status::Error, now), None);
        assert_eq!(t.check_timeouts(Status::Idle, now), None);
    }

    #[test]
    fn high_output_rate_reads_as_executing() {
        let mut t = tracker();
        let start = Instant::now();
        t.update_io_rate(50_000, start);
        // Crossing the window boundary computes the rate over the window.
        t.update_io_rate(1, start + Duration::from_secs(3));
        let (status, conf) = t.analyze_io_behavior(Status::Shell, start + Duration::from_secs(3));
        assert_eq!(status, Status::Executing);
        assert_eq!(conf, 0.75);
    }

    #[test]
    fn shell_prompt_detection_shapes() {
        assert!(detect_shell_prompt("user@host:~/src $"));
        assert!(detect_shell_prompt("  % "));
        assert!(detect_shell_prompt("root@box:/etc #"));
        assert!(detect_shell_prompt("❯ cargo build"));
        assert!(!detect_shell_prompt("❯ Claude session"));
        assert!(!detect_shell_prompt("│ user@host:~ │"));
        assert!(!detect_shell_prompt(""));
    }

    #[test]
    fn agent_prompt_detection_shapes() {
        assert!(looks_like_agent_prompt("> "));
        assert!(looks_like_agent_prompt("  >"));
        assert!(looks_like_agent_prompt("│ > type here │"));
        assert!(!looks_like_agent_prompt("no prompt here"));
    }

    #[test]
    fn line_ring_is_bounded() {
        let mut t = tracker();
        let now = Instant::now();
        for i in 0..(MAX_LINES + 25) {
            t.ingest_lines(&format!("line {i}\n"), now);
        }
        assert_eq!(t.lines.len(), MAX_LINES);
        assert_eq!(t.lines.front().unwrap().content, "line 25");
    }
}
