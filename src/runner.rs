/// One background run, start to finish: PID marker, launch notice,
/// supervision, reconciliation, and the crash path when any of those fail.
use crate::config::CourierConfig;
use crate::heartbeat::HeartbeatEmitter;
use crate::liveness::LivenessThresholds;
use crate::notify::{load_token, truncate, GatewayNotifier, Notifier, Relay};
use crate::pidfile::{PidFile, PidFileError};
use crate::reconcile::{crash_message, reconcile, ReconcileError, Reconciliation, RunOutcome};
use crate::registry::{JsonFileRegistry, SessionRegistry};
use crate::signals::{ShutdownSignal, SignalHandler};
use crate::supervisor::{supervise, Invocation, SupervisorError, SupervisorSettings};
use crate::task::{fmt_duration, TaskRun};
use std::future::Future;

/// Characters of the resume token shown in the launch notice.
const RESUME_PREVIEW_CHARS: usize = 12;

/// Errors that turn a run into a crash.
#[derive(Debug)]
pub enum RunError {
    PidFile(PidFileError),
    Supervisor(SupervisorError),
    Reconcile(ReconcileError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::PidFile(e) => write!(f, "{e}"),
            RunError::Supervisor(e) => write!(f, "{e}"),
            RunError::Reconcile(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::PidFile(e) => Some(e),
            RunError::Supervisor(e) => Some(e),
            RunError::Reconcile(e) => Some(e),
        }
    }
}

impl From<PidFileError> for RunError {
    fn from(e: PidFileError) -> Self {
        RunError::PidFile(e)
    }
}

impl From<SupervisorError> for RunError {
    fn from(e: SupervisorError) -> Self {
        RunError::Supervisor(e)
    }
}

impl From<ReconcileError> for RunError {
    fn from(e: ReconcileError) -> Self {
        RunError::Reconcile(e)
    }
}

/// Run `task` against the real gateway and registry, stopping the agent on
/// SIGINT or SIGTERM.
///
/// Returns the outcome, or `None` when `--resume` named an unknown session.
pub async fn run(config: &CourierConfig, task: &TaskRun) -> Option<RunOutcome> {
    let relay = Relay::new(
        gateway_sink(config, task),
        task.session_key.clone(),
        &config.gateway.channel,
    );
    let registry = JsonFileRegistry::new(config.storage.registry_file.clone());
    match SignalHandler::install() {
        Ok(mut handler) => execute(config, task, &relay, &registry, handler.recv()).await,
        Err(e) => {
            tracing::warn!(error = %e, "could not install signal handlers");
            execute(config, task, &relay, &registry, std::future::pending()).await
        }
    }
}

/// Notifications are only wired up for runs with an originating session.
fn gateway_sink(config: &CourierConfig, task: &TaskRun) -> Option<GatewayNotifier> {
    task.session_key.as_ref()?;
    match load_token(&config.gateway.token_file) {
        Ok(token) => Some(GatewayNotifier::new(&config.gateway, token)),
        Err(e) => {
            tracing::warn!(error = %e, "gateway token unavailable, notifications disabled");
            None
        }
    }
}

pub async fn execute<N: Notifier, R: SessionRegistry>(
    config: &CourierConfig,
    task: &TaskRun,
    relay: &Relay<N>,
    registry: &R,
    shutdown: impl Future<Output = ShutdownSignal>,
) -> Option<RunOutcome> {
    match attempt(config, task, relay, registry, shutdown).await {
        Ok(Reconciliation::Finished {
            outcome,
            output_file,
        }) => {
            tracing::info!(output = %output_file.display(), "result saved");
            Some(outcome)
        }
        Ok(Reconciliation::ResumeNotFound) => None,
        Err(e) => {
            let error = e.to_string();
            tracing::error!(error = %error, task = %truncate(&task.task, 100), "run crashed");
            let delivery = relay.notify_session(&crash_message(task, &error)).await;
            if !delivery.wake.is_sent() {
                relay
                    .background(&format!("💥 Claude Code crash: {}", truncate(&error, 200)))
                    .await
                    .log("crash fallback");
            }
            Some(RunOutcome::Crashed { error })
        }
    }
}

async fn attempt<N: Notifier, R: SessionRegistry>(
    config: &CourierConfig,
    task: &TaskRun,
    relay: &Relay<N>,
    registry: &R,
    shutdown: impl Future<Output = ShutdownSignal>,
) -> Result<Reconciliation, RunError> {
    let pid_file = PidFile::create(&config.storage.pid_dir, &task.task)?;

    tracing::info!(
        task = %truncate(&task.task, 100),
        project = %task.project.display(),
        timeout = %fmt_duration(task.timeout),
        resume = ?task.resume,
        label = ?task.label,
        session = ?task.session_key,
        output = %task.output_file.display(),
        pid_file = %pid_file.path().display(),
        "starting run"
    );

    relay.background(&launch_message(task)).await.log("launch");

    let invocation = Invocation::for_task(&config.agent, task);
    let settings = SupervisorSettings::new(&config.supervisor, task.timeout);
    let heartbeat = relay.has_chat_target().then(|| {
        HeartbeatEmitter::new(
            relay,
            config.heartbeat.interval(),
            LivenessThresholds::from(&config.heartbeat),
        )
    });

    let supervised = supervise(&invocation, &settings, heartbeat, shutdown).await?;
    Ok(reconcile(task, &supervised, relay, registry).await?)
}

fn launch_message(task: &TaskRun) -> String {
    let mut lines = vec!["🚀 *Claude Code started*".to_string()];
    if let Some(label) = &task.label {
        lines.push(format!("*Label:* {label}"));
    }
    lines.push(format!("*Project:* {}", task.project.display()));
    lines.push(format!("*Timeout:* {}", fmt_duration(task.timeout)));
    if let Some(token) = &task.resume {
        lines.push(format!(
            "*Resume:* {}...",
            truncate(token, RESUME_PREVIEW_CHARS)
        ));
    }
    lines.push(format!("*PID:* {}", std::process::id()));
    lines.push(String::new());
    lines.push("*Prompt:*".to_string());
    lines.push(task.task.clone());
    lines.join("\n")
}
