//! The status snapshot file.
//!
//! Rewritten from scratch every poll iteration so that monitoring scripts
//! can see what the daemon last decided. There is no locking; readers that
//! catch a torn write simply read again.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::signal::Signal;
use tracing::warn;

pub const STATUS_DIR: &str = "/var/run/oomward";
pub const STATUS_FILENAME: &str = "/var/run/oomward/status";

/// Best-effort creation of the runtime directory. Usually the service
/// manager provides it; failure here only means status writes will warn.
pub fn ensure_status_dir() {
    if let Err(e) = fs::create_dir_all(STATUS_DIR) {
        warn!("could not create {STATUS_DIR}: {e}");
    }
}

/// Write the four-line status snapshot.
///
/// Lines: status word, MemAvailable percent, the setpoint that triggered
/// the current state, and the time of writing as a unix epoch.
pub fn update_status(
    path: &Path,
    sig: Option<Signal>,
    emergency: bool,
    high: bool,
    memavail_percent: f64,
    setpoint: f64,
) {
    let word = if high {
        "high"
    } else if emergency {
        "emergency"
    } else {
        match sig {
            Some(Signal::SIGTERM) => "term",
            Some(Signal::SIGKILL) => "kill",
            _ => "ok",
        }
    };
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let body = format!("{word}\n{memavail_percent:.2}\n{setpoint:.2}\n{epoch}\n");
    if let Err(e) = fs::write(path, body) {
        warn!("failed to write status file ({}): {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_ok_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        update_status(&path, None, false, false, 61.237, 0.0);
        let lines = read_lines(&path);
        assert_eq!(lines[0], "ok");
        assert_eq!(lines[1], "61.24");
        assert_eq!(lines[2], "0.00");
        assert!(lines[3].parse::<u64>().unwrap() > 1_500_000_000);
    }

    #[test]
    fn test_status_word_priority() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");

        update_status(&path, Some(Signal::SIGTERM), false, false, 8.0, 10.0);
        assert_eq!(read_lines(&path)[0], "term");

        update_status(&path, Some(Signal::SIGKILL), false, false, 4.0, 5.0);
        assert_eq!(read_lines(&path)[0], "kill");

        update_status(&path, Some(Signal::SIGKILL), true, false, 1.0, 2.0);
        assert_eq!(read_lines(&path)[0], "emergency");

        // "high" beats everything else.
        update_status(&path, Some(Signal::SIGKILL), true, true, 12.0, 15.0);
        assert_eq!(read_lines(&path)[0], "high");
    }

    #[test]
    fn test_file_is_rewritten_not_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        update_status(&path, None, false, false, 50.0, 0.0);
        update_status(&path, None, false, false, 40.0, 0.0);
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "40.00");
    }
}
