/// Signal handling for shutdown.
///
/// SIGINT and SIGTERM both stop the run: the agent's process group is
/// terminated the same way as on timeout, and the run ends on the crash path
/// so the originating session still hears about it.
///
/// The agent runs in its own process group, so a terminal Ctrl-C reaches
/// only courier. Without these handlers courier would die and leave the
/// agent running.
use std::fmt;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Which signal asked courier to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Listeners for SIGINT and SIGTERM. Once installed, those signals no longer
/// kill the process.
pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
}

impl SignalHandler {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next SIGINT or SIGTERM.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        }
    }
}
