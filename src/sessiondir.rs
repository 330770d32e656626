//! The per-user session directory: socket, pid file, session metadata,
//! query cache, and logs all live under `~/.bdg/`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Session metadata persisted by the daemon while a session is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFile {
    /// Worker process id.
    pub bdg_pid: u32,
    pub chrome_pid: u32,
    pub start_time: String,
    pub port: u16,
    pub target_id: String,
    pub web_socket_debugger_url: String,
    #[serde(default)]
    pub active_telemetry: Vec<String>,
}

/// Errors from session directory operations.
#[derive(Debug)]
pub enum SessionDirError {
    /// Could not determine home directory.
    NoHomeDir,
    /// I/O error reading/writing a session file.
    Io(std::io::Error),
    /// A session file contains invalid JSON.
    InvalidFormat(String),
}

impl fmt::Display for SessionDirError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHomeDir => write!(f, "could not determine home directory"),
            Self::Io(e) => write!(f, "session file error: {e}"),
            Self::InvalidFormat(e) => write!(f, "invalid session file: {e}"),
        }
    }
}

impl std::error::Error for SessionDirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionDirError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SessionDirError> for crate::error::AppError {
    fn from(e: SessionDirError) -> Self {
        Self::general(e.to_string())
    }
}

/// The per-user session directory, `~/.bdg/`.
///
/// # Errors
///
/// Returns `SessionDirError::NoHomeDir` if the home directory cannot be
/// determined.
pub fn session_dir() -> Result<PathBuf, SessionDirError> {
    let home = dirs::home_dir().ok_or(SessionDirError::NoHomeDir)?;
    Ok(home.join(".bdg"))
}

/// Create the session directory with restrictive permissions.
///
/// # Errors
///
/// Returns `SessionDirError::Io` on I/O failure.
pub fn ensure_session_dir(dir: &Path) -> Result<(), SessionDirError> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[must_use]
pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join("daemon.sock")
}

#[must_use]
pub fn pid_path(dir: &Path) -> PathBuf {
    dir.join("session.pid")
}

#[must_use]
pub fn session_json_path(dir: &Path) -> PathBuf {
    dir.join("session.json")
}

#[must_use]
pub fn query_cache_path(dir: &Path) -> PathBuf {
    dir.join("query-cache.json")
}

#[must_use]
pub fn daemon_log_path(dir: &Path) -> PathBuf {
    dir.join("daemon.log")
}

#[must_use]
pub fn worker_log_path(dir: &Path) -> PathBuf {
    dir.join("worker.log")
}

/// Write a value as JSON via temp-file + atomic rename, mode 0600 on Unix.
///
/// # Errors
///
/// Returns `SessionDirError::Io` on I/O failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SessionDirError> {
    if let Some(parent) = path.parent() {
        ensure_session_dir(parent)?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SessionDirError::InvalidFormat(e.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read a JSON file, returning `Ok(None)` if it does not exist.
///
/// # Errors
///
/// Returns `SessionDirError::InvalidFormat` on malformed JSON or
/// `SessionDirError::Io` on other I/O errors.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, SessionDirError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let value: T = serde_json::from_str(&contents)
                .map_err(|e| SessionDirError::InvalidFormat(e.to_string()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionDirError::Io(e)),
    }
}

/// Delete a file, succeeding if it is already gone.
///
/// # Errors
///
/// Returns `SessionDirError::Io` on I/O errors other than "not found".
pub fn remove_file(path: &Path) -> Result<(), SessionDirError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SessionDirError::Io(e)),
    }
}

/// Write the worker PID file: a single integer line.
///
/// # Errors
///
/// Returns `SessionDirError::Io` on I/O failure.
pub fn write_pid(path: &Path, pid: u32) -> Result<(), SessionDirError> {
    if let Some(parent) = path.parent() {
        ensure_session_dir(parent)?;
    }
    std::fs::write(path, format!("{pid}\n"))?;
    Ok(())
}

/// Read the worker PID file.
///
/// # Errors
///
/// Returns `SessionDirError::InvalidFormat` if the contents are not an
/// integer, or `SessionDirError::Io` on other I/O errors.
pub fn read_pid(path: &Path) -> Result<Option<u32>, SessionDirError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SessionDirError::InvalidFormat(format!("bad pid file: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SessionDirError::Io(e)),
    }
}

/// Current time in epoch seconds as a float (CDP-style wall clock).
#[must_use]
pub fn epoch_secs_f64() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Format the current time as a simplified ISO 8601 string.
#[must_use]
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    format_unix_secs(secs)
}

/// Civil date from epoch seconds, Howard Hinnant's algorithm.
#[allow(
    clippy::similar_names,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn format_unix_secs(secs: u64) -> String {
    let day_secs = secs % 86_400;
    let hours = day_secs / 3_600;
    let minutes = (day_secs % 3_600) / 60;
    let seconds = day_secs % 60;

    let mut days = (secs / 86_400) as i64;
    days += 719_468; // shift epoch from 1970-01-01 to 0000-03-01
    let era = if days >= 0 { days } else { days - 146_096 } / 146_097;
    let day_of_era = (days - era * 146_097) as u32; // [0, 146096]
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let y = i64::from(year_of_era) + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let d = day_of_year - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_use_well_known_names() {
        let dir = Path::new("/tmp/bdg-test");
        assert!(socket_path(dir).ends_with("daemon.sock"));
        assert!(pid_path(dir).ends_with("session.pid"));
        assert!(session_json_path(dir).ends_with("session.json"));
        assert!(query_cache_path(dir).ends_with("query-cache.json"));
        assert!(daemon_log_path(dir).ends_with("daemon.log"));
        assert!(worker_log_path(dir).ends_with("worker.log"));
    }

    #[test]
    fn format_unix_epoch() {
        assert_eq!(format_unix_secs(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn format_known_timestamp() {
        // 2001-09-09T01:46:40Z = 1_000_000_000 seconds since epoch
        assert_eq!(format_unix_secs(1_000_000_000), "2001-09-09T01:46:40Z");
    }

    #[test]
    fn session_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = session_json_path(dir.path());

        let data = SessionFile {
            bdg_pid: 1234,
            chrome_pid: 5678,
            start_time: "2026-08-01T12:00:00Z".into(),
            port: 9222,
            target_id: "T1".into(),
            web_socket_debugger_url: "ws://127.0.0.1:9222/devtools/page/T1".into(),
            active_telemetry: vec!["network".into(), "console".into()],
        };

        write_json_atomic(&path, &data).unwrap();
        let read: SessionFile = read_json(&path).unwrap().unwrap();

        assert_eq!(read.bdg_pid, 1234);
        assert_eq!(read.chrome_pid, 5678);
        assert_eq!(read.port, 9222);
        assert_eq!(read.active_telemetry, vec!["network", "console"]);
    }

    #[test]
    fn session_file_uses_camel_case_keys() {
        let data = SessionFile {
            bdg_pid: 1,
            chrome_pid: 2,
            start_time: "2026-08-01T00:00:00Z".into(),
            port: 9222,
            target_id: "T1".into(),
            web_socket_debugger_url: "ws://x".into(),
            active_telemetry: vec![],
        };
        let json: serde_json::Value = serde_json::to_value(&data).unwrap();
        assert!(json.get("bdgPid").is_some());
        assert!(json.get("chromePid").is_some());
        assert!(json.get("startTime").is_some());
        assert!(json.get("webSocketDebuggerUrl").is_some());
        assert!(json.get("activeTelemetry").is_some());
    }

    #[test]
    fn read_nonexistent_returns_none() {
        let result: Option<SessionFile> =
            read_json(Path::new("/tmp/bdg-test-nonexistent/session.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn read_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result: Result<Option<SessionFile>, _> = read_json(&path);
        assert!(matches!(result, Err(SessionDirError::InvalidFormat(_))));
    }

    #[test]
    fn remove_nonexistent_is_ok() {
        assert!(remove_file(Path::new("/tmp/bdg-test-del-nonexist/x.json")).is_ok());
    }

    #[test]
    fn pid_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(dir.path());
        write_pid(&path, 4321).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "4321\n");
        assert_eq!(read_pid(&path).unwrap(), Some(4321));
    }

    #[test]
    fn read_pid_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_path(dir.path());
        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(matches!(
            read_pid(&path),
            Err(SessionDirError::InvalidFormat(_))
        ));
    }
}
