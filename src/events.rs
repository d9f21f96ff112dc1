/// Stream-json event folding: each stdout line of the agent is one JSON
/// event, folded into the run's `ProgressState` as it arrives.
///
/// Recognized shapes:
/// - `system` with `subtype: "init"` carries the external `session_id`
/// - `stream_event` wraps an inner `event` (`content_block_start`,
///   `content_block_delta`, `content_block_stop`, `message_delta`); the
///   inner shapes are also accepted at top level
/// - `assistant` carries a complete message with content blocks and usage
/// - `result` carries the final text
///
/// Anything else is ignored. Malformed lines never error.
use crate::progress::{Activity, ProgressState};
use serde_json::Value;
use tokio::time::Instant;

/// Maximum characters of a shell command shown as activity.
const COMMAND_PREVIEW_CHARS: usize = 50;

/// Fold one raw stream line into `state`.
pub fn apply_line(state: &mut ProgressState, line: &str, now: Instant) {
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return, // not an event
    };
    apply_event(state, &v, now);
}

/// Fold one parsed event into `state`.
pub fn apply_event(state: &mut ProgressState, v: &Value, now: Instant) {
    // Any well-formed event counts as a sign of life.
    state.touch(now);

    let kind = str_field(v, "type");

    // Unwrap the stream_event envelope if present.
    let (inner, inner_kind) = if kind == Some("stream_event") {
        let inner = v.get("event").unwrap_or(&Value::Null);
        (inner, str_field(inner, "type"))
    } else {
        (v, kind)
    };

    match inner_kind {
        Some("content_block_start") => block_start(state, inner),
        Some("content_block_delta") => block_delta(state, inner),
        Some("message_delta") => add_output_tokens(state, inner.get("usage")),
        _ => {}
    }

    match kind {
        Some("system") => {
            if str_field(v, "subtype") == Some("init") && state.session_id.is_none() {
                if let Some(id) = str_field(v, "session_id") {
                    tracing::debug!(session_id = id, "captured agent session id");
                    state.session_id = Some(id.to_string());
                }
            }
        }
        Some("assistant") => assistant_turn(state, v),
        Some("result") => state.activity = Some(Activity::Finishing),
        _ => {}
    }
}

fn block_start(state: &mut ProgressState, event: &Value) {
    let block = match event.get("content_block") {
        Some(b) => b,
        None => return,
    };
    match str_field(block, "type") {
        Some("tool_use") => {
            let tool = str_field(block, "name").unwrap_or("?");
            state.activity = Some(Activity::Starting {
                tool: tool.to_string(),
            });
        }
        Some("thinking") => state.activity = Some(Activity::Thinking),
        _ => {}
    }
}

fn block_delta(state: &mut ProgressState, event: &Value) {
    state.chunks_since_heartbeat += 1;
    match event.get("delta").and_then(|d| str_field(d, "type")) {
        Some("thinking_delta") => state.activity = Some(Activity::Thinking),
        Some("text_delta") => state.activity = Some(Activity::Writing),
        _ => {}
    }
}

fn assistant_turn(state: &mut ProgressState, v: &Value) {
    let message = match v.get("message") {
        Some(m) => m,
        None => return,
    };

    add_output_tokens(state, message.get("usage"));

    let content = match message.get("content").and_then(|c| c.as_array()) {
        Some(arr) => arr,
        None => return,
    };

    for block in content {
        if str_field(block, "type") != Some("tool_use") {
            continue;
        }
        state.tool_calls += 1;
        let tool = str_field(block, "name").unwrap_or("?");
        let input = block.get("input").unwrap_or(&Value::Null);
        state.activity = Some(classify_tool(state, tool, input));
    }
}

/// Map a tool invocation to the activity it represents, recording written
/// files along the way.
fn classify_tool(state: &mut ProgressState, tool: &str, input: &Value) -> Activity {
    let lower = tool.to_lowercase();
    match lower.as_str() {
        "write" | "edit" => {
            let file = basename(str_field(input, "file_path").unwrap_or("?"));
            state.files_written.push(file.clone());
            Activity::Edited {
                tool: tool.to_string(),
                file,
            }
        }
        "read" => Activity::Read {
            file: basename(str_field(input, "file_path").unwrap_or("?")),
        },
        "bash" => Activity::Running {
            command: str_field(input, "command")
                .unwrap_or("?")
                .chars()
                .take(COMMAND_PREVIEW_CHARS)
                .collect(),
        },
        _ if lower.contains("search") || lower.contains("grep") => Activity::Searching {
            tool: tool.to_string(),
        },
        _ => Activity::Using {
            tool: tool.to_string(),
        },
    }
}

fn add_output_tokens(state: &mut ProgressState, usage: Option<&Value>) {
    if let Some(tokens) = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|t| t.as_u64())
    {
        state.output_tokens = state.output_tokens.saturating_add(tokens);
    }
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|t| t.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fresh() -> (ProgressState, Instant) {
        let now = Instant::now();
        (ProgressState::new(now), now)
    }

    #[test]
    fn test_init_captures_session_id_once() {
        let (mut state, now) = fresh();
        apply_line(
            &mut state,
            r#"{"type":"system","subtype":"init","session_id":"abc-123"}"#,
            now,
        );
        apply_line(
            &mut state,
            r#"{"type":"system","subtype":"init","session_id":"later"}"#,
            now,
        );
        assert_eq!(state.session_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_non_init_system_event_ignored() {
        let (mut state, now) = fresh();
        apply_line(
            &mut state,
            r#"{"type":"system","subtype":"compact","session_id":"x"}"#,
            now,
        );
        assert!(state.session_id.is_none());
    }

    #[test]
    fn test_block_start_in_envelope() {
        let (mut state, now) = fresh();
        apply_line(
            &mut state,
            r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"tool_use","name":"Bash"}}}"#,
            now,
        );
        assert_eq!(
            state.activity,
            Some(Activity::Starting {
                tool: "Bash".to_string()
            })
        );

        apply_line(
            &mut state,
            r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"thinking"}}}"#,
            now,
        );
        assert_eq!(state.activity, Some(Activity::Thinking));
    }

    #[test]
    fn test_top_level_block_start_accepted() {
        let (mut state, now) = fresh();
        apply_line(
            &mut state,
            r#"{"type":"content_block_start","content_block":{"type":"thinking"}}"#,
            now,
        );
        assert_eq!(state.activity, Some(Activity::Thinking));
    }

    #[test]
    fn test_deltas_count_chunks_and_set_activity() {
        let (mut state, now) = fresh();
        apply_line(
            &mut state,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"thinking_delta","thinking":"hmm"}}}"#,
            now,
        );
        assert_eq!(state.activity, Some(Activity::Thinking));
        apply_line(
            &mut state,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}}"#,
            now,
        );
        assert_eq!(state.activity, Some(Activity::Writing));
        apply_line(
            &mut state,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta"}}}"#,
            now,
        );
        assert_eq!(state.activity, Some(Activity::Writing));
        assert_eq!(state.chunks_since_heartbeat, 3);
    }

    #[test]
    fn test_message_delta_accumulates_tokens() {
        let (mut state, now) = fresh();
        let line = r#"{"type":"stream_event","event":{"type":"message_delta","usage":{"output_tokens":40}}}"#;
        apply_line(&mut state, line, now);
        apply_line(&mut state, line, now);
        assert_eq!(state.output_tokens, 80);
    }

    #[test]
    fn test_assistant_turn_classifies_tools() {
        let (mut state, now) = fresh();
        apply_line(
            &mut state,
            r#"{"type":"assistant","message":{"usage":{"output_tokens":12},"content":[
                {"type":"text","text":"Let me look."},
                {"type":"tool_use","name":"Read","input":{"file_path":"/repo/src/lib.rs"}},
                {"type":"tool_use","name":"Write","input":{"file_path":"/repo/src/new.rs"}}
            ]}}"#,
            now,
        );
        assert_eq!(state.tool_calls, 2);
        assert_eq!(state.output_tokens, 12);
        assert_eq!(state.files_written, vec!["new.rs"]);
        assert_eq!(
            state.activity,
            Some(Activity::Edited {
                tool: "Write".to_string(),
                file: "new.rs".to_string()
            })
        );
    }

    #[test]
    fn test_tool_classification_variants() {
        let (mut state, _) = fresh();
        let long_cmd = "x".repeat(80);
        assert_eq!(
            classify_tool(&mut state, "Bash", &serde_json::json!({"command": long_cmd})),
            Activity::Running {
                command: "x".repeat(50)
            }
        );
        assert_eq!(
            classify_tool(&mut state, "Read", &serde_json::json!({"file_path": "a/b/c.txt"})),
            Activity::Read {
                file: "c.txt".to_string()
            }
        );
        assert_eq!(
            classify_tool(&mut state, "Grep", &Value::Null),
            Activity::Searching {
                tool: "Grep".to_string()
            }
        );
        assert_eq!(
            classify_tool(&mut state, "WebSearch", &Value::Null),
            Activity::Searching {
                tool: "WebSearch".to_string()
            }
        );
        assert_eq!(
            classify_tool(&mut state, "TodoWrite", &Value::Null),
            Activity::Using {
                tool: "TodoWrite".to_string()
            }
        );
        assert_eq!(
            classify_tool(&mut state, "edit", &Value::Null),
            Activity::Edited {
                tool: "edit".to_string(),
                file: "?".to_string()
            }
        );
        assert_eq!(state.files_written, vec!["?"]);
    }

    #[test]
    fn test_multibyte_command_truncation_does_not_panic() {
        let (mut state, _) = fresh();
        let cmd = "é".repeat(60);
        let activity = classify_tool(&mut state, "bash", &serde_json::json!({"command": cmd}));
        assert_eq!(
            activity,
            Activity::Running {
                command: "é".repeat(50)
            }
        );
    }

    #[test]
    fn test_result_sets_finishing() {
        let (mut state, now) = fresh();
        apply_line(&mut state, r#"{"type":"result","result":"Done."}"#, now);
        assert_eq!(state.activity, Some(Activity::Finishing));
    }

    #[test]
    fn test_garbage_never_panics_and_timestamp_monotonic() {
        let t0 = Instant::now();
        let mut state = ProgressState::new(t0);
        let lines = [
            "",
            "not json",
            "{",
            "null",
            "42",
            "[1,2,3]",
            r#"{"type":7}"#,
            r#"{"type":"assistant"}"#,
            r#"{"type":"assistant","message":{"content":"nope"}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":5}]}}"#,
            r#"{"type":"stream_event"}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_start"}}"#,
            r#"{"type":"message_delta","usage":{"output_tokens":-5}}"#,
            r#"{"type":"unknown_kind","payload":{}}"#,
        ];
        let mut previous = state.last_event;
        for (i, line) in lines.iter().enumerate() {
            // Feed timestamps out of order to exercise monotonicity.
            let offset = if i % 2 == 0 { i as u64 } else { 0 };
            apply_line(&mut state, line, t0 + Duration::from_secs(offset));
            assert!(state.last_event >= previous);
            previous = state.last_event;
        }
        assert_eq!(state.output_tokens, 0);
        assert_eq!(state.tool_calls, 1);
    }

    #[test]
    fn test_well_formed_event_updates_timestamp_malformed_does_not() {
        let t0 = Instant::now();
        let mut state = ProgressState::new(t0);
        apply_line(&mut state, "garbage", t0 + Duration::from_secs(5));
        assert_eq!(state.last_event, t0);
        apply_line(&mut state, r#"{"type":"ping"}"#, t0 + Duration::from_secs(5));
        assert_eq!(state.last_event, t0 + Duration::from_secs(5));
    }
}
