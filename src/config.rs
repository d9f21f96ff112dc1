use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from courier.toml.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub agent: AgentConfig,
    pub supervisor: SupervisorConfig,
    pub heartbeat: HeartbeatConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub resume_flag: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub default_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub kill_grace_secs: u64,
    /// Upper bound on waiting for the agent to be reaped after SIGKILL.
    pub reap_wait_secs: u64,
    pub reader_join_secs: u64,
    /// Run `git init` in the project directory when it is not a repository yet.
    pub init_git: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub healthy_secs: u64,
    pub degraded_secs: u64,
    pub thinking_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub url: String,
    pub token_file: PathBuf,
    pub channel: String,
    pub background_prefix: String,
    pub request_timeout_secs: u64,
    pub wake_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub registry_file: PathBuf,
}

// --- Default implementations ---

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "{prompt}".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--include-partial-messages".to_string(),
            ],
            resume_flag: "--resume".to_string(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 7200,
            poll_interval_secs: 5,
            kill_grace_secs: 10,
            reap_wait_secs: 5,
            reader_join_secs: 5,
            init_git: true,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            healthy_secs: 30,
            degraded_secs: 120,
            thinking_secs: 15,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:18789".to_string(),
            token_file: PathBuf::from("~/.openclaw/openclaw.json"),
            channel: "whatsapp".to_string(),
            background_prefix: "📡 ".to_string(),
            request_timeout_secs: 15,
            wake_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp"),
            pid_dir: PathBuf::from("~/.openclaw/courier/pids"),
            registry_file: PathBuf::from("~/.openclaw/claude_sessions.json"),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl CourierConfig {
    /// Load config from `path`. A missing file yields the defaults; an
    /// unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default().expanded());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: CourierConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(config.expanded())
    }

    /// Resolve `~/` prefixes in every configured path.
    fn expanded(mut self) -> Self {
        self.gateway.token_file = expand_home(&self.gateway.token_file);
        self.storage.output_dir = expand_home(&self.storage.output_dir);
        self.storage.pid_dir = expand_home(&self.storage.pid_dir);
        self.storage.registry_file = expand_home(&self.storage.registry_file);
        self
    }
}

/// Replace a leading `~` component with `$HOME`. Paths without one, or when
/// `$HOME` is unset, are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CourierConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.supervisor.default_timeout_secs, 7200);
        assert_eq!(config.supervisor.poll_interval_secs, 5);
        assert_eq!(config.heartbeat.interval_secs, 60);
        assert!(config
            .agent
            .args
            .contains(&"--include-partial-messages".to_string()));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(
            &path,
            "[heartbeat]\ninterval_secs = 30\n\n[gateway]\nchannel = \"telegram\"\n",
        )
        .unwrap();

        let config = CourierConfig::load(&path).unwrap();
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.heartbeat.healthy_secs, 30);
        assert_eq!(config.heartbeat.degraded_secs, 120);
        assert_eq!(config.gateway.channel, "telegram");
        assert_eq!(config.gateway.url, "http://localhost:18789");
    }

    #[test]
    fn test_supervisor_timings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[supervisor]\nkill_grace_secs = 3\nreap_wait_secs = 2\n").unwrap();

        let config = CourierConfig::load(&path).unwrap();
        assert_eq!(config.supervisor.kill_grace_secs, 3);
        assert_eq!(config.supervisor.reap_wait_secs, 2);
        assert_eq!(config.supervisor.reader_join_secs, 5);
        assert_eq!(CourierConfig::default().supervisor.reap_wait_secs, 5);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(&path, "[supervisor\npoll_interval_secs = ").unwrap();
        let err = CourierConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_expand_home_only_touches_tilde_prefix() {
        assert_eq!(
            expand_home(Path::new("/var/run/x.pid")),
            PathBuf::from("/var/run/x.pid")
        );
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/.openclaw/openclaw.json")),
                PathBuf::from(home).join(".openclaw/openclaw.json")
            );
        }
    }
}
