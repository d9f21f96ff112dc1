use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One invocation of the agent, fixed for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub task: String,
    pub project: PathBuf,
    pub timeout: Duration,
    /// Agent session to continue instead of starting fresh.
    pub resume: Option<String>,
    pub label: Option<String>,
    /// Originating session to notify; notifications are off without it.
    pub session_key: Option<String>,
    pub output_file: PathBuf,
}

/// Result file path derived from the invocation time: `<dir>/cc-YYYYmmdd-HHMMSS.txt`.
pub fn default_output_path(dir: &Path, now: DateTime<Local>) -> PathBuf {
    dir.join(format!("cc-{}.txt", now.format("%Y%m%d-%H%M%S")))
}

/// `45s` under a minute, otherwise whole minutes: `2min`.
pub fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}min", secs / 60)
    }
}
