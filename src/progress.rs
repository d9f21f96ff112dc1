/// Run progress: the accumulated state folded from the agent's event stream,
/// and the shared tracker the stream reader and the supervisor both hold.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// What the agent was last seen doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    /// A tool invocation block just opened.
    Starting { tool: String },
    Thinking,
    Writing,
    /// A write/edit tool touched `file` (basename only).
    Edited { tool: String, file: String },
    Read { file: String },
    /// Shell command, already truncated for display.
    Running { command: String },
    Searching { tool: String },
    Using { tool: String },
    Finishing,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Starting { tool } => write!(f, "▶️ {tool} starting..."),
            Activity::Thinking => write!(f, "🧠 Thinking..."),
            Activity::Writing => write!(f, "✍️ Writing..."),
            Activity::Edited { tool, file } => write!(f, "📝 {tool}: {file}"),
            Activity::Read { file } => write!(f, "👁 read: {file}"),
            Activity::Running { command } => write!(f, "💻 bash: {command}"),
            Activity::Searching { tool } => write!(f, "🔍 {tool}"),
            Activity::Using { tool } => write!(f, "🔧 {tool}"),
            Activity::Finishing => write!(f, "✅ finishing..."),
        }
    }
}

/// Accumulated progress of a single run.
///
/// Counters only ever grow, except `chunks_since_heartbeat` which the
/// heartbeat resets after each emission.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub tool_calls: u64,
    pub files_written: Vec<String>,
    pub activity: Option<Activity>,
    /// External run id from the `system/init` event; set at most once.
    pub session_id: Option<String>,
    pub last_event: Instant,
    pub output_tokens: u64,
    pub chunks_since_heartbeat: u64,
}

impl ProgressState {
    pub fn new(now: Instant) -> Self {
        Self {
            tool_calls: 0,
            files_written: Vec::new(),
            activity: None,
            session_id: None,
            last_event: now,
            output_tokens: 0,
            chunks_since_heartbeat: 0,
        }
    }

    /// Record that an event was observed at `now`. Never moves backwards.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_event {
            self.last_event = now;
        }
    }
}

/// Everything the agent printed, kept for end-of-run result extraction.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    /// Non-empty stdout lines in arrival order.
    pub lines: Vec<String>,
    pub stderr: String,
}

#[derive(Debug)]
struct Shared {
    state: ProgressState,
    output: CapturedOutput,
}

/// Cloneable handle to the progress of a running agent.
///
/// Only the stream reader writes through `record_*`; the supervisor reads
/// snapshots. Each call holds the lock for a single field-level update, so a
/// snapshot is always internally consistent.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    shared: Arc<Mutex<Shared>>,
}

impl ProgressTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: ProgressState::new(now),
                output: CapturedOutput::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panicking reader must not take the heartbeat down with it.
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture one stdout line and fold it into the progress state.
    pub fn record_line(&self, line: &str, now: Instant) {
        let mut shared = self.lock();
        shared.output.lines.push(line.to_string());
        crate::events::apply_line(&mut shared.state, line, now);
    }

    /// Capture one stderr line.
    pub fn record_stderr(&self, line: &str) {
        let mut shared = self.lock();
        if !shared.output.stderr.is_empty() {
            shared.output.stderr.push('\n');
        }
        shared.output.stderr.push_str(line);
    }

    pub fn snapshot(&self) -> ProgressState {
        self.lock().state.clone()
    }

    /// Snapshot for a heartbeat, resetting the content-increment counter in
    /// the same critical section so no increment is counted twice or lost.
    pub fn take_heartbeat_snapshot(&self) -> ProgressState {
        let mut shared = self.lock();
        let snapshot = shared.state.clone();
        shared.state.chunks_since_heartbeat = 0;
        snapshot
    }

    pub fn captured(&self) -> CapturedOutput {
        self.lock().output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_activity_display() {
        assert_eq!(Activity::Thinking.to_string(), "🧠 Thinking...");
        assert_eq!(
            Activity::Edited {
                tool: "Write".to_string(),
                file: "main.rs".to_string()
            }
            .to_string(),
            "📝 Write: main.rs"
        );
        assert_eq!(
            Activity::Running {
                command: "cargo test".to_string()
            }
            .to_string(),
            "💻 bash: cargo test"
        );
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let t0 = Instant::now();
        let mut state = ProgressState::new(t0 + Duration::from_secs(10));
        state.touch(t0);
        assert_eq!(state.last_event, t0 + Duration::from_secs(10));
        state.touch(t0 + Duration::from_secs(20));
        assert_eq!(state.last_event, t0 + Duration::from_secs(20));
    }

    #[test]
    fn test_tracker_captures_lines_and_stderr() {
        let now = Instant::now();
        let tracker = ProgressTracker::new(now);
        tracker.record_line(r#"{"type":"result","result":"ok"}"#, now);
        tracker.record_line("not json", now);
        tracker.record_stderr("warning: one");
        tracker.record_stderr("warning: two");

        let output = tracker.captured();
        assert_eq!(output.lines.len(), 2);
        assert_eq!(output.stderr, "warning: one\nwarning: two");
        assert_eq!(tracker.snapshot().activity, Some(Activity::Finishing));
    }

    #[test]
    fn test_heartbeat_snapshot_resets_chunk_counter() {
        let now = Instant::now();
        let tracker = ProgressTracker::new(now);
        let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"hi"}}}"#;
        tracker.record_line(delta, now);
        tracker.record_line(delta, now);

        let snapshot = tracker.take_heartbeat_snapshot();
        assert_eq!(snapshot.chunks_since_heartbeat, 2);
        assert_eq!(tracker.snapshot().chunks_since_heartbeat, 0);
    }

    #[test]
    fn test_tracker_clones_share_state() {
        let now = Instant::now();
        let tracker = ProgressTracker::new(now);
        let reader = tracker.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                reader.record_line(
                    r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Glob","input":{}}]}}"#,
                    Instant::now(),
                );
            }
        });
        for _ in 0..100 {
            let _ = tracker.take_heartbeat_snapshot();
        }
        handle.join().unwrap();
        assert_eq!(tracker.snapshot().tool_calls, 100);
        assert_eq!(tracker.captured().lines.len(), 100);
    }
}
