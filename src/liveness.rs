/// Liveness classification and activity rendering for heartbeats.
///
/// Both derive only from the idle gap (time since the last observed event)
/// and a progress snapshot, so rendering never depends on the reader being
/// quiescent.
use crate::config::HeartbeatConfig;
use crate::progress::{Activity, ProgressState};
use std::time::Duration;
use tokio::time::Instant;

/// Coarse health of the agent as seen from its event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Degraded,
    Stalled,
}

impl Liveness {
    pub fn glyph(self) -> &'static str {
        match self {
            Liveness::Healthy => "🟢",
            Liveness::Degraded => "🟡",
            Liveness::Stalled => "🔴",
        }
    }
}

/// Idle-gap thresholds. Policy constants, kept configurable.
#[derive(Debug, Clone, Copy)]
pub struct LivenessThresholds {
    /// Below this gap the agent is healthy.
    pub healthy: Duration,
    /// Below this gap the agent is degraded; at or above it, stalled.
    pub degraded: Duration,
    /// Gap after which silence with no streamed content reads as thinking.
    pub thinking: Duration,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self::from(&HeartbeatConfig::default())
    }
}

impl From<&HeartbeatConfig> for LivenessThresholds {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            healthy: Duration::from_secs(config.healthy_secs),
            degraded: Duration::from_secs(config.degraded_secs),
            thinking: Duration::from_secs(config.thinking_secs),
        }
    }
}

/// Time since the last observed event, zero if `now` is somehow earlier.
pub fn idle_gap(state: &ProgressState, now: Instant) -> Duration {
    now.saturating_duration_since(state.last_event)
}

pub fn classify(idle: Duration, thresholds: &LivenessThresholds) -> Liveness {
    if idle < thresholds.healthy {
        Liveness::Healthy
    } else if idle < thresholds.degraded {
        Liveness::Degraded
    } else {
        Liveness::Stalled
    }
}

/// Render the "what is it doing" line, or `None` when there is nothing to say.
///
/// Long silence wins over the last recorded activity: the agent is most
/// likely reasoning without streaming.
pub fn activity_line(
    state: &ProgressState,
    idle: Duration,
    thresholds: &LivenessThresholds,
) -> Option<String> {
    if idle > thresholds.degraded {
        return Some(format!("{} ({}s)", Activity::Thinking, idle.as_secs()));
    }
    if idle > thresholds.thinking && state.chunks_since_heartbeat == 0 {
        return Some(Activity::Thinking.to_string());
    }
    let activity = state.activity.as_ref()?;
    if state.chunks_since_heartbeat > 0 {
        Some(format!("{activity} ✍️"))
    } else {
        Some(activity.to_string())
    }
}
