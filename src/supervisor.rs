/// Agent process supervision: spawn the agent, drain its output on a
/// dedicated reader task, poll for exit, enforce the timeout with
/// SIGTERM-then-SIGKILL, and emit heartbeats while it runs.
///
/// States: `Starting → Running → {Completed | TimedOut | KilledOnError}`.
/// Whatever happens, the agent's process group is dead before `supervise`
/// returns.
use crate::config::{AgentConfig, SupervisorConfig};
use crate::heartbeat::HeartbeatEmitter;
use crate::notify::Notifier;
use crate::progress::{CapturedOutput, ProgressState, ProgressTracker};
use crate::signals::ShutdownSignal;
use crate::task::TaskRun;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;

/// Supervisor lifecycle states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Completed,
    TimedOut,
    KilledOnError,
}

fn transition(state: SupervisorState) {
    tracing::info!(?state, "supervisor state");
}

/// The concrete command line for one run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    /// Expand the agent template for `run`, appending the resume flag when
    /// continuing a previous session.
    pub fn for_task(agent: &AgentConfig, run: &TaskRun) -> Self {
        let mut args = build_args(agent, &run.task);
        if let Some(token) = &run.resume {
            args.push(agent.resume_flag.clone());
            args.push(token.clone());
        }
        Self {
            command: agent.command.clone(),
            args,
            cwd: run.project.clone(),
        }
    }
}

/// Build the command arguments, replacing `{prompt}` placeholders with the task.
fn build_args(agent_config: &AgentConfig, prompt: &str) -> Vec<String> {
    agent_config
        .args
        .iter()
        .map(|arg| arg.replace("{prompt}", prompt))
        .collect()
}

/// Timing policy for one supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub reap_wait: Duration,
    pub reader_join: Duration,
    pub init_git: bool,
}

impl SupervisorSettings {
    pub fn new(config: &SupervisorConfig, timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            reap_wait: Duration::from_secs(config.reap_wait_secs),
            reader_join: Duration::from_secs(config.reader_join_secs),
            init_git: config.init_git,
        }
    }
}

/// What the supervisor observed once the agent is gone.
#[derive(Debug)]
pub struct SupervisedRun {
    /// Exit code; `None` when killed by a signal or never reaped.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
    pub pid: u32,
    pub progress: ProgressState,
    pub output: CapturedOutput,
}

/// Errors that abort supervision.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to create the working directory.
    Workdir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the agent subprocess.
    Spawn { source: std::io::Error },
    /// Failed to poll the agent for exit.
    Wait { source: std::io::Error },
    /// courier itself was asked to stop while the agent ran.
    Interrupted { signal: ShutdownSignal },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Workdir { path, source } => {
                write!(
                    f,
                    "failed to create working directory {}: {}",
                    path.display(),
                    source
                )
            }
            SupervisorError::Spawn { source } => {
                write!(f, "failed to spawn agent subprocess: {}", source)
            }
            SupervisorError::Wait { source } => {
                write!(f, "failed to poll agent subprocess: {}", source)
            }
            SupervisorError::Interrupted { signal } => {
                write!(f, "interrupted by {}, agent terminated", signal)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Workdir { source, .. } => Some(source),
            SupervisorError::Spawn { source } => Some(source),
            SupervisorError::Wait { source } => Some(source),
            SupervisorError::Interrupted { .. } => None,
        }
    }
}

/// Create the working directory and, when asked, make it a git repository.
/// Idempotent; a failing `git init` is logged and tolerated.
pub async fn prepare_workdir(dir: &Path, init_git: bool) -> Result<(), SupervisorError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SupervisorError::Workdir {
            path: dir.to_path_buf(),
            source: e,
        })?;

    if init_git && !dir.join(".git").exists() {
        match Command::new("git")
            .args(["init", "-q"])
            .current_dir(dir)
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                tracing::info!(dir = %dir.display(), "initialized git repository")
            }
            Ok(out) => tracing::warn!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "git init failed"
            ),
            Err(e) => tracing::warn!(error = %e, "could not run git init"),
        }
    }
    Ok(())
}

enum Watch {
    Exited(ExitStatus),
    TimedOut,
}

/// Run the agent to completion, timeout, or until `shutdown` resolves.
///
/// The agent is spawned in its own process group so termination reaches any
/// children it started. On error after spawn, including a shutdown signal,
/// the group is killed before the error is returned.
pub async fn supervise<N: Notifier>(
    invocation: &Invocation,
    settings: &SupervisorSettings,
    mut heartbeat: Option<HeartbeatEmitter<'_, N>>,
    shutdown: impl Future<Output = ShutdownSignal>,
) -> Result<SupervisedRun, SupervisorError> {
    tokio::pin!(shutdown);
    transition(SupervisorState::Starting);
    prepare_workdir(&invocation.cwd, settings.init_git).await?;

    tracing::info!(
        command = %invocation.command,
        args = ?invocation.args,
        cwd = %invocation.cwd.display(),
        "spawning agent"
    );

    let mut child = Command::new(&invocation.command)
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0) // New process group for clean kill
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SupervisorError::Spawn { source: e })?;

    let start = Instant::now();
    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "agent subprocess started");
    transition(SupervisorState::Running);

    let tracker = ProgressTracker::new(start);
    let reader = tokio::spawn(drain(
        child.stdout.take(),
        child.stderr.take(),
        tracker.clone(),
    ));

    let watched = watch(
        &mut child,
        &tracker,
        settings,
        start,
        &mut heartbeat,
        shutdown.as_mut(),
    )
    .await;
    let (status, timed_out) = match watched {
        Ok(Watch::Exited(status)) => {
            transition(SupervisorState::Completed);
            (Some(status), false)
        }
        Ok(Watch::TimedOut) => {
            transition(SupervisorState::TimedOut);
            (terminate(&mut child, settings).await, true)
        }
        Err(e) => {
            transition(SupervisorState::KilledOnError);
            terminate(&mut child, settings).await;
            return Err(e);
        }
    };

    match tokio::time::timeout(settings.reader_join, reader).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "stream reader failed"),
        Err(_) => tracing::warn!(
            wait_secs = settings.reader_join.as_secs(),
            "stream reader still busy, continuing with output captured so far"
        ),
    }

    let elapsed = start.elapsed();
    let exit_code = status.and_then(|s| s.code());
    tracing::info!(
        exit_code = ?exit_code,
        timed_out,
        duration_secs = elapsed.as_secs(),
        "agent finished"
    );

    Ok(SupervisedRun {
        exit_code,
        timed_out,
        elapsed,
        pid,
        progress: tracker.snapshot(),
        output: tracker.captured(),
    })
}

/// Poll until the agent exits or the timeout passes, ticking the heartbeat.
/// A shutdown signal ends the watch with [`SupervisorError::Interrupted`].
async fn watch<N: Notifier, S: Future<Output = ShutdownSignal>>(
    child: &mut Child,
    tracker: &ProgressTracker,
    settings: &SupervisorSettings,
    start: Instant,
    heartbeat: &mut Option<HeartbeatEmitter<'_, N>>,
    mut shutdown: Pin<&mut S>,
) -> Result<Watch, SupervisorError> {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(settings.poll_interval) => {}
            signal = shutdown.as_mut() => {
                tracing::warn!(%signal, "shutdown requested, terminating agent");
                return Err(SupervisorError::Interrupted { signal });
            }
        }

        if let Some(status) = child
            .try_wait()
            .map_err(|e| SupervisorError::Wait { source: e })?
        {
            return Ok(Watch::Exited(status));
        }

        let elapsed = start.elapsed();
        if elapsed >= settings.timeout {
            tracing::warn!(
                timeout_secs = settings.timeout.as_secs(),
                "timeout reached, terminating agent"
            );
            return Ok(Watch::TimedOut);
        }

        if let Some(emitter) = heartbeat.as_mut() {
            emitter.tick(elapsed, tracker).await;
        }
    }
}

/// SIGTERM the agent's group, wait up to the kill grace, then SIGKILL.
/// Returns the exit status if the agent was reaped.
async fn terminate(child: &mut Child, settings: &SupervisorSettings) -> Option<ExitStatus> {
    let grace = settings.kill_grace;
    let pgid = match child.id() {
        Some(pid) => Pid::from_raw(pid as i32),
        // Already reaped.
        None => return child.try_wait().ok().flatten(),
    };

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        tracing::debug!(error = %e, "SIGTERM to agent group failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(?status, "agent exited after SIGTERM");
            return Some(status);
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "wait after SIGTERM failed"),
        Err(_) => tracing::warn!(
            grace_secs = grace.as_secs(),
            "agent ignored SIGTERM, sending SIGKILL"
        ),
    }

    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        tracing::debug!(error = %e, "SIGKILL to agent group failed");
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "direct kill failed");
    }
    match tokio::time::timeout(settings.reap_wait, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "wait after SIGKILL failed");
            None
        }
        Err(_) => {
            tracing::error!("agent still not reaped after SIGKILL");
            None
        }
    }
}

/// Reader task: drain stdout into the tracker and stderr into the captured
/// error text until both streams close.
async fn drain(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>, tracker: ProgressTracker) {
    let mut out = stdout.map(|s| BufReader::new(s).lines());
    let mut err = stderr.map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            line = next_line(&mut out, "stdout"), if out.is_some() => match line {
                Some(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        tracker.record_line(line, Instant::now());
                    }
                }
                None => out = None,
            },
            line = next_line(&mut err, "stderr"), if err.is_some() => match line {
                Some(line) => tracker.record_stderr(&line),
                None => err = None,
            },
            else => break,
        }
    }
    tracing::debug!("agent output streams closed");
}

/// Next line from an optional stream; `None` at EOF or on a read error.
/// Lines that are not valid UTF-8 are skipped.
async fn next_line<R: AsyncBufRead + Unpin>(
    lines: &mut Option<Lines<R>>,
    stream: &str,
) -> Option<String> {
    let lines = lines.as_mut()?;
    loop {
        match lines.next_line().await {
            Ok(line) => return line,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                tracing::debug!(stream, "skipping non-UTF-8 line");
            }
            Err(e) => {
                tracing::warn!(stream, error = %e, "failed to read agent output");
                return None;
            }
        }
    }
}
