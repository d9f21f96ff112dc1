mod config;
mod events;
mod heartbeat;
mod liveness;
mod notify;
mod pidfile;
mod progress;
mod reconcile;
mod registry;
mod runner;
mod signals;
mod supervisor;
mod task;

use clap::Parser;
use config::CourierConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use task::TaskRun;
use tracing_subscriber::EnvFilter;

/// Run a coding agent task in the background: supervise the agent process,
/// relay heartbeats to the originating chat, and report the result when done.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about)]
pub struct Cli {
    /// Task prompt for the agent
    #[arg(short, long)]
    task: String,

    /// Project directory the agent works in (created if missing)
    #[arg(short, long, default_value = "/tmp/cc-scratch")]
    project: PathBuf,

    /// Originating session key; enables notifications
    #[arg(short, long)]
    session: Option<String>,

    /// Result file (default: <output_dir>/cc-<timestamp>.txt)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Agent session id to continue
    #[arg(long)]
    resume: Option<String>,

    /// Human-readable label for the session registry
    #[arg(long)]
    session_label: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "courier.toml")]
    config: PathBuf,

    /// Debug logging (stream events, supervisor polls)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "courier=debug"
    } else {
        "courier=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match CourierConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let task = TaskRun {
        task: cli.task,
        project: cli.project,
        timeout: Duration::from_secs(
            cli.timeout
                .unwrap_or(config.supervisor.default_timeout_secs),
        ),
        resume: cli.resume,
        label: cli.session_label,
        session_key: cli.session,
        output_file: cli.output.unwrap_or_else(|| {
            task::default_output_path(&config.storage.output_dir, chrono::Local::now())
        }),
    };

    match runner::run(&config, &task).await {
        Some(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
