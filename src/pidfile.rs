/// Per-run PID marker files, so running tasks can be listed and stale
/// markers from dead runs pruned.
///
/// Marker content is three lines: PID, task summary, start time (RFC 3339).
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Characters of the task kept in the marker body.
const SUMMARY_CHARS: usize = 60;
/// Characters of the task kept in the marker file name.
const NAME_CHARS: usize = 40;

/// A live marker file; removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Prune stale markers in `dir`, then write one for this process.
    pub fn create(dir: &Path, task: &str) -> Result<Self, PidFileError> {
        std::fs::create_dir_all(dir).map_err(|e| PidFileError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let pruned = cleanup_stale(dir);
        if pruned > 0 {
            tracing::info!(pruned, dir = %dir.display(), "removed stale pid files");
        }

        let now = Local::now();
        let summary: String = task.chars().take(SUMMARY_CHARS).collect();
        let path = dir.join(marker_name(now, task));
        let body = format!("{}\n{}\n{}", std::process::id(), summary, now.to_rfc3339());
        std::fs::write(&path, body).map_err(|e| PidFileError::Write {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to remove pid file");
            }
        }
    }
}

/// `<YYYYmmdd-HHMMSS>-<sanitized task prefix>.pid`
pub fn marker_name(now: DateTime<Local>, task: &str) -> String {
    let safe: String = task
        .chars()
        .take(NAME_CHARS)
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}.pid", now.format("%Y%m%d-%H%M%S"), safe)
}

/// Remove markers whose process no longer exists. Returns how many were removed.
pub fn cleanup_stale(dir: &Path) -> usize {
    let pattern = format!("{}/*.pid", glob::Pattern::escape(&dir.to_string_lossy()));
    let entries = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, "invalid pid file pattern");
            return 0;
        }
    };

    let mut removed = 0;
    for path in entries.flatten() {
        let alive = std::fs::read_to_string(&path)
            .ok()
            .and_then(|body| body.lines().next().and_then(|l| l.trim().parse::<i32>().ok()))
            .is_some_and(process_alive);
        if alive {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "failed to remove stale pid file"),
        }
    }
    removed
}

/// Probe with signal 0. A process we may not signal still exists.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Errors from PID file operations.
#[derive(Debug)]
pub enum PidFileError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PidFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidFileError::Write { path, source } => {
                write!(f, "failed to write pid file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PidFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PidFileError::Write { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_marker_name_sanitizes_task() {
        let now = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(
            marker_name(now, "Build X: fix /etc & more"),
            "20260304-050607-Build-X--fix--etc---more.pid"
        );
        let long = "a".repeat(100);
        assert_eq!(
            marker_name(now, &long),
            format!("20260304-050607-{}.pid", "a".repeat(40))
        );
    }

    #[test]
    fn test_create_writes_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let pid_file = PidFile::create(&dir.path().join("pids"), "Build the thing").unwrap();
            let body = std::fs::read_to_string(pid_file.path()).unwrap();
            let lines: Vec<&str> = body.lines().collect();
            assert_eq!(lines[0], std::process::id().to_string());
            assert_eq!(lines[1], "Build the thing");
            assert!(DateTime::parse_from_rfc3339(lines[2]).is_ok());
            pid_file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_removes_dead_and_garbage_keeps_live() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.pid");
        let dead = dir.path().join("dead.pid");
        let garbage = dir.path().join("garbage.pid");
        let unrelated = dir.path().join("notes.txt");
        std::fs::write(&live, format!("{}\ntask\n", std::process::id())).unwrap();
        // Above any kernel pid_max, so never a running process.
        std::fs::write(&dead, format!("{}\ntask\n", i32::MAX)).unwrap();
        std::fs::write(&garbage, "not-a-pid\n").unwrap();
        std::fs::write(&unrelated, "1").unwrap();

        assert_eq!(cleanup_stale(dir.path()), 2);
        assert!(live.exists());
        assert!(!dead.exists());
        assert!(!garbage.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cleanup_stale(&dir.path().join("absent")), 0);
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }
}
