/// Periodic status pings while the agent runs.
///
/// A heartbeat renders one compact line, e.g.
/// `🟢 CC (3min) | 1.5K tok | 12 calls | 📝 Edit: main.rs ✍️`,
/// and posts it as a background message.
use crate::liveness::{self, LivenessThresholds};
use crate::notify::{Delivery, Notifier, Relay};
use crate::progress::{ProgressState, ProgressTracker};
use std::time::Duration;
use tokio::time::Instant;

/// Format a token count: 999 → `999`, 1500 → `1.5K`, 12345 → `12K`.
pub fn format_tokens(n: u64) -> String {
    if n < 1_000 {
        n.to_string()
    } else if n < 10_000 {
        format!("{:.1}K", n as f64 / 1000.0)
    } else {
        format!("{}K", n / 1000)
    }
}

/// Render a status line from a snapshot. Zero counters are omitted.
pub fn render_status(
    state: &ProgressState,
    elapsed: Duration,
    now: Instant,
    thresholds: &LivenessThresholds,
) -> String {
    let idle = liveness::idle_gap(state, now);
    let status = liveness::classify(idle, thresholds);

    let mut parts = vec![format!("{} CC ({}min)", status.glyph(), elapsed.as_secs() / 60)];
    if state.output_tokens > 0 {
        parts.push(format!("{} tok", format_tokens(state.output_tokens)));
    }
    if state.tool_calls > 0 {
        parts.push(format!("{} calls", state.tool_calls));
    }
    if let Some(activity) = liveness::activity_line(state, idle, thresholds) {
        parts.push(activity);
    }
    parts.join(" | ")
}

/// Fixed-cadence schedule measured in run time.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Duration,
    last: Duration,
}

impl HeartbeatSchedule {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Duration::ZERO,
        }
    }

    /// True when a heartbeat is due at `elapsed`; marks it as taken.
    pub fn due(&mut self, elapsed: Duration) -> bool {
        if elapsed.saturating_sub(self.last) >= self.interval {
            self.last = elapsed;
            true
        } else {
            false
        }
    }
}

/// Emits heartbeats for one run through a relay.
pub struct HeartbeatEmitter<'a, N> {
    relay: &'a Relay<N>,
    schedule: HeartbeatSchedule,
    thresholds: LivenessThresholds,
}

impl<'a, N: Notifier> HeartbeatEmitter<'a, N> {
    pub fn new(relay: &'a Relay<N>, interval: Duration, thresholds: LivenessThresholds) -> Self {
        Self {
            relay,
            schedule: HeartbeatSchedule::new(interval),
            thresholds,
        }
    }

    /// Called on every supervisor poll. Sends a heartbeat when one is due
    /// and returns its delivery.
    pub async fn tick(&mut self, elapsed: Duration, tracker: &ProgressTracker) -> Option<Delivery> {
        if !self.schedule.due(elapsed) {
            return None;
        }
        let snapshot = tracker.take_heartbeat_snapshot();
        let line = render_status(&snapshot, elapsed, Instant::now(), &self.thresholds);
        tracing::debug!(status = %line, "heartbeat");
        Some(self.relay.background(&line).await.log("heartbeat"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::progress::Activity;

    const KEY: &str = "agent:main:whatsapp:group:42@g.us";

    #[test]
    fn test_format_tokens() {
        assert_eq!(format_tokens(0), "0");
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1000), "1.0K");
        assert_eq!(format_tokens(1500), "1.5K");
        assert_eq!(format_tokens(9999), "10.0K");
        assert_eq!(format_tokens(12345), "12K");
        assert_eq!(format_tokens(10_000), "10K");
    }

    #[test]
    fn test_render_minimal_status() {
        let now = Instant::now();
        let state = ProgressState::new(now);
        let line = render_status(
            &state,
            Duration::from_secs(59),
            now,
            &LivenessThresholds::default(),
        );
        assert_eq!(line, "🟢 CC (0min)");
    }

    #[test]
    fn test_render_full_status() {
        let now = Instant::now();
        let mut state = ProgressState::new(now);
        state.output_tokens = 1500;
        state.tool_calls = 7;
        state.chunks_since_heartbeat = 2;
        state.activity = Some(Activity::Edited {
            tool: "Edit".to_string(),
            file: "main.rs".to_string(),
        });
        let line = render_status(
            &state,
            Duration::from_secs(185),
            now + Duration::from_secs(3),
            &LivenessThresholds::default(),
        );
        assert_eq!(line, "🟢 CC (3min) | 1.5K tok | 7 calls | 📝 Edit: main.rs ✍️");
    }

    #[test]
    fn test_render_stalled_status() {
        let now = Instant::now();
        let mut state = ProgressState::new(now);
        state.tool_calls = 1;
        let line = render_status(
            &state,
            Duration::from_secs(600),
            now + Duration::from_secs(200),
            &LivenessThresholds::default(),
        );
        assert_eq!(line, "🔴 CC (10min) | 1 calls | 🧠 Thinking... (200s)");
    }

    #[test]
    fn test_schedule_three_beats_over_185_seconds() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(60));
        let beats: Vec<u64> = (1..=37)
            .map(|poll| Duration::from_secs(poll * 5))
            .filter(|elapsed| schedule.due(*elapsed))
            .map(|elapsed| elapsed.as_secs())
            .collect();
        assert_eq!(beats, vec![60, 120, 180]);
    }

    #[test]
    fn test_schedule_with_irregular_polls() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(60));
        assert!(!schedule.due(Duration::from_secs(59)));
        assert!(schedule.due(Duration::from_secs(63)));
        assert!(!schedule.due(Duration::from_secs(120)));
        assert!(schedule.due(Duration::from_secs(123)));
    }

    #[tokio::test]
    async fn test_emitter_sends_and_resets_chunks() {
        let relay = Relay::new(
            Some(RecordingNotifier::default()),
            Some(KEY.to_string()),
            "whatsapp",
        );
        let tracker = ProgressTracker::new(Instant::now());
        tracker.record_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"x"}}}"#,
            Instant::now(),
        );

        let mut emitter =
            HeartbeatEmitter::new(&relay, Duration::from_secs(60), LivenessThresholds::default());
        assert_eq!(emitter.tick(Duration::from_secs(5), &tracker).await, None);
        assert_eq!(
            emitter.tick(Duration::from_secs(60), &tracker).await,
            Some(Delivery::Sent)
        );
        assert_eq!(tracker.snapshot().chunks_since_heartbeat, 0);

        let texts = relay.sink().unwrap().background_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("🟢 CC (1min)"));
        assert!(texts[0].ends_with("✍️ Writing... ✍️"));
    }

    #[tokio::test]
    async fn test_emitter_failure_is_not_fatal() {
        let relay = Relay::new(
            Some(RecordingNotifier::failing()),
            Some(KEY.to_string()),
            "whatsapp",
        );
        let tracker = ProgressTracker::new(Instant::now());
        let mut emitter =
            HeartbeatEmitter::new(&relay, Duration::from_secs(60), LivenessThresholds::default());
        let delivery = emitter.tick(Duration::from_secs(60), &tracker).await;
        assert!(matches!(delivery, Some(Delivery::Failed(_))));
        // Next beat still scheduled normally.
        assert!(emitter.tick(Duration::from_secs(120), &tracker).await.is_some());
    }
}
