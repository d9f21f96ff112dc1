/// Notification relay to the local messaging gateway.
///
/// Two kinds of delivery:
/// - background: posted straight to the chat target, prefixed with a marker
///   glyph so the agent on the other side is not woken
/// - session wake: queued into the originating session so the agent there
///   processes the result
///
/// Every call is best-effort and reports a [`Delivery`] instead of failing.
use crate::config::GatewayConfig;
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outcome of a best-effort notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Nothing to send to (no target, no token).
    Skipped(&'static str),
    Failed(String),
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }

    /// Log the delivery under `what`. Failures are warnings, never errors.
    pub fn log(self, what: &str) -> Self {
        match &self {
            Delivery::Sent => tracing::debug!(what, "notification sent"),
            Delivery::Skipped(reason) => tracing::debug!(what, reason, "notification skipped"),
            Delivery::Failed(error) => {
                tracing::warn!(what, error = %error, "notification failed")
            }
        }
        self
    }
}

/// Result of notifying the originating session: the chat copy and the wake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDelivery {
    pub chat: Delivery,
    pub wake: Delivery,
}

/// Transport for notifications.
pub trait Notifier: Send + Sync {
    /// Post `text` to the chat `target` without waking the agent.
    fn send_background(&self, target: &str, text: &str) -> impl Future<Output = Delivery> + Send;

    /// Queue `text` into the agent session identified by `session_key`.
    fn wake_session(&self, session_key: &str, text: &str)
        -> impl Future<Output = Delivery> + Send;
}

/// Errors from reading the gateway token.
#[derive(Debug)]
pub enum TokenError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Missing {
        path: PathBuf,
    },
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            TokenError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            TokenError::Missing { path } => {
                write!(f, "no gateway.auth.token in {}", path.display())
            }
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::Read { source, .. } => Some(source),
            TokenError::Parse { source, .. } => Some(source),
            TokenError::Missing { .. } => None,
        }
    }
}

/// Read the bearer token at `gateway.auth.token` from the gateway's JSON config.
pub fn load_token(path: &Path) -> Result<String, TokenError> {
    let contents = std::fs::read_to_string(path).map_err(|e| TokenError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let v: Value = serde_json::from_str(&contents).map_err(|e| TokenError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    v.pointer("/gateway/auth/token")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| TokenError::Missing {
            path: path.to_path_buf(),
        })
}

/// Chat target embedded in a session key: the `:`-separated part naming a group.
pub fn extract_target(session_key: &str) -> Option<&str> {
    session_key.split(':').find(|part| part.contains("@g.us"))
}

/// HTTP client for the gateway's `/tools/invoke` endpoint.
pub struct GatewayNotifier {
    client: reqwest::Client,
    url: String,
    token: String,
    channel: String,
    background_prefix: String,
    request_timeout: Duration,
    wake_timeout: Duration,
}

impl GatewayNotifier {
    pub fn new(config: &GatewayConfig, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            token,
            channel: config.channel.clone(),
            background_prefix: config.background_prefix.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            wake_timeout: Duration::from_secs(config.wake_timeout_secs),
        }
    }

    async fn invoke(&self, body: Value, timeout: Duration) -> Delivery {
        let url = format!("{}/tools/invoke", self.url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(timeout)
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Delivery::Sent,
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                Delivery::Failed(format!("HTTP {status}: {}", truncate(&text, 200)))
            }
            Err(e) => Delivery::Failed(e.to_string()),
        }
    }
}

impl Notifier for GatewayNotifier {
    async fn send_background(&self, target: &str, text: &str) -> Delivery {
        let body = json!({
            "tool": "message",
            "args": {
                "action": "send",
                "channel": self.channel,
                "target": target,
                "message": format!("{}{}", self.background_prefix, text),
            }
        });
        self.invoke(body, self.request_timeout).await
    }

    async fn wake_session(&self, session_key: &str, text: &str) -> Delivery {
        let body = json!({
            "tool": "sessions_send",
            "args": {
                "sessionKey": session_key,
                "message": text,
            }
        });
        self.invoke(body, self.wake_timeout).await
    }
}

/// Where notifications for one run go, and through what.
///
/// `sink` is absent when no session key was given or the token could not be
/// loaded; every send then reports `Skipped`.
pub struct Relay<N> {
    sink: Option<N>,
    session_key: Option<String>,
    target: Option<String>,
    channel: String,
}

impl<N: Notifier> Relay<N> {
    pub fn new(sink: Option<N>, session_key: Option<String>, channel: &str) -> Self {
        let target = session_key
            .as_deref()
            .and_then(extract_target)
            .map(str::to_string);
        Self {
            sink,
            session_key,
            target,
            channel: channel.to_string(),
        }
    }

    /// Whether background messages (launch info, heartbeats) can be delivered.
    pub fn has_chat_target(&self) -> bool {
        self.sink.is_some() && self.target.is_some()
    }

    #[cfg(test)]
    pub fn sink(&self) -> Option<&N> {
        self.sink.as_ref()
    }

    /// Post a background message to the chat target.
    pub async fn background(&self, text: &str) -> Delivery {
        match (&self.sink, &self.target) {
            (Some(sink), Some(target)) => sink.send_background(target, text).await,
            (None, _) => Delivery::Skipped("notifications disabled"),
            (_, None) => Delivery::Skipped("no chat target in session key"),
        }
    }

    /// Deliver a result: chat copy for the human, then a wake for the agent.
    pub async fn notify_session(&self, message: &str) -> SessionDelivery {
        let chat = self.background(message).await.log("chat");
        let wake = match (&self.sink, &self.session_key) {
            (Some(sink), Some(key)) => {
                let wrapped = wake_message(message, &self.channel, self.target.as_deref());
                sink.wake_session(key, &wrapped).await
            }
            (None, _) => Delivery::Skipped("notifications disabled"),
            (_, None) => Delivery::Skipped("no session key"),
        }
        .log("session wake");
        SessionDelivery { chat, wake }
    }
}

/// Wrap a result for the waking agent with instructions on where to reply.
fn wake_message(message: &str, channel: &str, target: Option<&str>) -> String {
    let target = target.unwrap_or("GROUP_JID");
    format!(
        "[CLAUDE_CODE_RESULT]\n{message}\n\n---\n\
         ⚠️ INSTRUCTION: You received a Claude Code result. Process it, then send your \
         response to the {channel} group using message(action=send, channel={channel}, \
         target={target}, message=YOUR_SUMMARY). Then reply NO_REPLY to avoid duplicate. \
         Do NOT rely on announce step."
    )
}

/// First `max` characters of `s`, never splitting a code point.
pub fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
