/// Session registry: a JSON file mapping agent session ids to what ran there,
/// so a later run can be pointed at `--resume <id>`.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Terminal status recorded for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
    Timeout,
}

/// What the caller knows about a finished run.
#[derive(Debug, Clone)]
pub struct SessionEntry<'a> {
    pub session_id: &'a str,
    pub label: Option<&'a str>,
    pub task: &'a str,
    pub project_dir: &'a Path,
    pub origin_session: Option<&'a str>,
    pub output_file: &'a Path,
    pub status: SessionStatus,
}

/// One persisted registry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub label: Option<String>,
    pub task: String,
    pub project_dir: String,
    pub origin_session: Option<String>,
    pub output_file: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keyed persistence of finished runs.
pub trait SessionRegistry {
    fn register(&self, entry: &SessionEntry<'_>) -> Result<(), RegistryError>;
}

/// Registry backed by a single JSON file.
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// All records, keyed by session id. A missing file is an empty registry.
    pub fn load(&self) -> Result<BTreeMap<String, SessionRecord>, RegistryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(RegistryError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|e| RegistryError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    fn save(&self, records: &BTreeMap<String, SessionRecord>) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| RegistryError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| RegistryError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let tmp_path = dir.join(format!(".sessions.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| RegistryError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| RegistryError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }
}

impl SessionRegistry for JsonFileRegistry {
    /// Insert or update the record for `entry.session_id`. Re-registering
    /// keeps the original `created_at`.
    fn register(&self, entry: &SessionEntry<'_>) -> Result<(), RegistryError> {
        let mut records = self.load()?;
        let now = Utc::now();
        let created_at = records
            .get(entry.session_id)
            .map(|r| r.created_at)
            .unwrap_or(now);

        records.insert(
            entry.session_id.to_string(),
            SessionRecord {
                session_id: entry.session_id.to_string(),
                label: entry.label.map(str::to_string),
                task: entry.task.to_string(),
                project_dir: entry.project_dir.display().to_string(),
                origin_session: entry.origin_session.map(str::to_string),
                output_file: entry.output_file.display().to_string(),
                status: entry.status,
                created_at,
                updated_at: now,
            },
        );
        self.save(&records)?;
        tracing::info!(session_id = entry.session_id, status = ?entry.status, "session registered");
        Ok(())
    }
}

/// Errors from registry operations.
#[derive(Debug)]
pub enum RegistryError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Read { path, source } => {
                write!(f, "failed to read registry {}: {}", path.display(), source)
            }
            RegistryError::Parse { path, source } => {
                write!(f, "failed to parse registry {}: {}", path.display(), source)
            }
            RegistryError::Serialize { source } => {
                write!(f, "failed to serialize registry: {}", source)
            }
            RegistryError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            RegistryError::Rename { from, to, source } => write!(
                f,
                "failed to rename {} to {}: {}",
                from.display(),
                to.display(),
                source
            ),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Read { source, .. } => Some(source),
            RegistryError::Parse { source, .. } => Some(source),
            RegistryError::Serialize { source } => Some(source),
            RegistryError::Write { source, .. } => Some(source),
            RegistryError::Rename { source, .. } => Some(source),
        }
    }
}
