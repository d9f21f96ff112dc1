/// End-of-run reconciliation: pick the final result text out of the captured
/// stream, persist it, classify the outcome, register the session and send
/// the one terminal notification.
use crate::notify::{truncate, Notifier, Relay};
use crate::registry::{SessionEntry, SessionRegistry, SessionStatus};
use crate::supervisor::SupervisedRun;
use crate::task::{fmt_duration, TaskRun};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Result text when the agent produced nothing usable.
pub const NO_OUTPUT: &str = "(no output captured)";

/// Characters of the result included in notifications.
const PREVIEW_CHARS: usize = 2000;
/// Characters of the task included in notifications.
const TASK_CHARS: usize = 200;

/// The agent's complaint when `--resume` names an unknown session.
static RESUME_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"No conversation found").unwrap());

/// Terminal classification of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// Non-zero exit; `-1` when the agent died from a signal.
    Failure { exit_code: i32 },
    TimedOut,
    Crashed { error: String },
}

impl RunOutcome {
    /// Timeout wins over whatever exit status the killed agent left behind.
    pub fn classify(timed_out: bool, exit_code: Option<i32>) -> Self {
        if timed_out {
            return RunOutcome::TimedOut;
        }
        match exit_code {
            Some(0) => RunOutcome::Success,
            code => RunOutcome::Failure {
                exit_code: code.unwrap_or(-1),
            },
        }
    }

    pub fn registry_status(&self) -> Option<SessionStatus> {
        match self {
            RunOutcome::Success => Some(SessionStatus::Completed),
            RunOutcome::Failure { .. } => Some(SessionStatus::Failed),
            RunOutcome::TimedOut => Some(SessionStatus::Timeout),
            RunOutcome::Crashed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

/// How reconciliation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// `--resume` pointed at a session the agent does not know; nothing was
    /// persisted or registered.
    ResumeNotFound,
    Finished {
        outcome: RunOutcome,
        output_file: PathBuf,
    },
}

/// Errors from reconciliation.
#[derive(Debug)]
pub enum ReconcileError {
    /// Failed to write the result file.
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::Persist { path, source } => {
                write!(f, "failed to write result {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Persist { source, .. } => Some(source),
        }
    }
}

pub fn resume_not_found(stderr: &str) -> bool {
    RESUME_NOT_FOUND.is_match(stderr)
}

/// Final result text, by the first tier that yields something:
/// 1. the `result` field of the last `result` event, if non-empty
/// 2. all assistant text blocks concatenated in arrival order, plus a newline
/// 3. the agent's stderr, or [`NO_OUTPUT`]
pub fn extract_result(lines: &[String], stderr: &str) -> String {
    let events: Vec<Value> = lines
        .iter()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();

    let final_result = events
        .iter()
        .rev()
        .find(|v| event_type(v) == Some("result"))
        .and_then(|v| v.get("result"))
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty());
    if let Some(text) = final_result {
        return text.to_string();
    }

    let mut text = String::new();
    for event in events.iter().filter(|v| event_type(v) == Some("assistant")) {
        let blocks = event
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array());
        for block in blocks.into_iter().flatten() {
            if event_type(block) == Some("text") {
                text.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or(""));
            }
        }
    }
    if !text.is_empty() {
        text.push('\n');
        return text;
    }

    if !stderr.trim().is_empty() {
        return stderr.to_string();
    }
    NO_OUTPUT.to_string()
}

fn event_type(v: &Value) -> Option<&str> {
    v.get("type").and_then(|t| t.as_str())
}

fn persist(path: &Path, text: &str) -> Result<(), ReconcileError> {
    let err = |e| ReconcileError::Persist {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    std::fs::write(path, text).map_err(err)
}

/// Reconcile a finished run. Called exactly once, after the supervisor has
/// returned.
pub async fn reconcile<N: Notifier, R: SessionRegistry>(
    run: &TaskRun,
    supervised: &SupervisedRun,
    relay: &Relay<N>,
    registry: &R,
) -> Result<Reconciliation, ReconcileError> {
    if let Some(token) = &run.resume {
        if resume_not_found(&supervised.output.stderr) {
            tracing::error!(resume = %token, "resume failed: agent session not found");
            relay.notify_session(&resume_failure_message(token)).await;
            return Ok(Reconciliation::ResumeNotFound);
        }
    }

    let text = extract_result(&supervised.output.lines, &supervised.output.stderr);
    persist(&run.output_file, &text)?;

    let outcome = RunOutcome::classify(supervised.timed_out, supervised.exit_code);
    tracing::info!(
        outcome = ?outcome,
        pid = supervised.pid,
        chars = text.chars().count(),
        minutes = supervised.elapsed.as_secs() / 60,
        output = %run.output_file.display(),
        "run finished"
    );

    match (&supervised.progress.session_id, outcome.registry_status()) {
        (Some(session_id), Some(status)) => {
            let entry = SessionEntry {
                session_id,
                label: run.label.as_deref(),
                task: &run.task,
                project_dir: &run.project,
                origin_session: run.session_key.as_deref(),
                output_file: &run.output_file,
                status,
            };
            if let Err(e) = registry.register(&entry) {
                tracing::warn!(error = %e, session_id = %session_id, "failed to register session");
            }
        }
        _ => tracing::debug!("no agent session id observed, skipping registry"),
    }

    let message = match &outcome {
        RunOutcome::TimedOut => timeout_message(run, supervised, &text),
        RunOutcome::Success => success_message(run, &text),
        RunOutcome::Failure { exit_code } => failure_message(run, *exit_code, &text),
        RunOutcome::Crashed { error } => crash_message(run, error),
    };
    relay.notify_session(&message).await;

    Ok(Reconciliation::Finished {
        outcome,
        output_file: run.output_file.clone(),
    })
}

fn timeout_message(run: &TaskRun, supervised: &SupervisedRun, text: &str) -> String {
    format!(
        "⏰ Claude Code timed out after {} (limit: {})\n\n\
         **Task:** {}\n\
         **Project:** {}\n\
         **Tool calls:** {}\n\n\
         Partial result ({} chars):\n\n\
         {}\n\n\
         📁 Full output: `{}`",
        fmt_duration(supervised.elapsed),
        fmt_duration(run.timeout),
        truncate(&run.task, TASK_CHARS),
        run.project.display(),
        supervised.progress.tool_calls,
        text.chars().count(),
        truncate(text, PREVIEW_CHARS),
        run.output_file.display(),
    )
}

fn success_message(run: &TaskRun, text: &str) -> String {
    let chars = text.chars().count();
    let note = if chars > PREVIEW_CHARS {
        "...(truncated, full output in file)"
    } else {
        ""
    };
    format!(
        "✅ Claude Code task complete!\n\n\
         **Task:** {}\n\
         **Project:** {}\n\
         **Result** ({} chars):\n\n\
         {}\n\n\
         {}\n\
         📁 Full output: `{}`",
        truncate(&run.task, TASK_CHARS),
        run.project.display(),
        chars,
        truncate(text, PREVIEW_CHARS),
        note,
        run.output_file.display(),
    )
}

fn failure_message(run: &TaskRun, exit_code: i32, text: &str) -> String {
    format!(
        "❌ Claude Code error (exit {})\n\n\
         **Task:** {}\n\
         **Project:** {}\n\n\
         {}",
        exit_code,
        truncate(&run.task, TASK_CHARS),
        run.project.display(),
        truncate(text, PREVIEW_CHARS),
    )
}

/// Sent when the supervisor itself failed before a result could be reconciled.
pub fn crash_message(run: &TaskRun, error: &str) -> String {
    format!(
        "💥 Claude Code script crashed!\n\n\
         **Task:** {}\n\
         **Error:** {}",
        truncate(&run.task, TASK_CHARS),
        truncate(error, 500),
    )
}

fn resume_failure_message(token: &str) -> String {
    format!(
        "❌ Claude Code resume failed\n\n\
         Session ID `{token}` not found or expired.\n\n\
         **Suggestion:** Start a fresh session without --resume flag."
    )
}
