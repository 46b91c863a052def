//! Read-only access to per-process kernel statistics.
//!
//! `ProcFs` wraps a procfs mount point. Production code uses `/proc`; tests
//! point it at a fabricated directory tree. Every accessor reads fresh from
//! the kernel, nothing is cached across calls: PIDs are reused and a stale
//! value is worse than a second read.
//!
//! Processes exit at any time, so every accessor can fail. Callers in the
//! selection path treat any failure as "drop this candidate" and move on.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use thiserror::Error;

use crate::meminfo::MemorySnapshot;

/// Why a per-process read failed.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("process does not exist")]
    NotFound,
    #[error("permission denied")]
    Permission,
    #[error("unparseable data: {0}")]
    Parse(String),
}

impl From<io::Error> for ProbeError {
    fn from(err: io::Error) -> Self {
        // Reading under a dying PID directory can surface ESRCH instead of
        // ENOENT depending on the kernel path taken.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Self::NotFound;
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::Permission,
            _ => Self::Parse(err.to_string()),
        }
    }
}

/// CPU and wall-clock times of one process, in seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTimes {
    pub utime: u64,
    pub stime: u64,
    pub cutime: u64,
    pub cstime: u64,
    /// Seconds since the process started, derived from the uptime and the
    /// kernel start time, clamped to zero.
    pub runtime: u64,
}

/// Handle on a procfs mount point.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    page_kib: i64,
    ticks_per_sec: f64,
}

impl ProcFs {
    /// The real `/proc`.
    pub fn new() -> Self {
        Self::at("/proc")
    }

    /// A procfs-shaped tree rooted elsewhere.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        // SAFETY: sysconf does not touch errno-visible state we rely on and
        // is callable at any time.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            root: root.into(),
            page_kib: if page_size > 0 { page_size / 1024 } else { 4 },
            ticks_per_sec: if ticks > 0 { ticks as f64 } else { 100.0 },
        }
    }

    fn pid_path(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn read_pid_file(&self, pid: i32, name: &str) -> Result<String, ProbeError> {
        Ok(fs::read_to_string(self.pid_path(pid).join(name))?)
    }

    /// All numeric entries of the process table, in directory order.
    ///
    /// The order matters: selection is a streaming pass and first-seen wins
    /// on full ties.
    pub fn pids(&self) -> io::Result<Vec<i32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(pid) = name.parse::<i32>() {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    /// The kernel-assigned badness heuristic.
    pub fn oom_score(&self, pid: i32) -> Result<i64, ProbeError> {
        self.read_pid_int(pid, "oom_score")
    }

    /// The user-settable badness adjustment. `-1000` marks a process the
    /// kernel itself would never kill.
    pub fn oom_score_adj(&self, pid: i32) -> Result<i64, ProbeError> {
        self.read_pid_int(pid, "oom_score_adj")
    }

    fn read_pid_int(&self, pid: i32, name: &str) -> Result<i64, ProbeError> {
        let text = self.read_pid_file(pid, name)?;
        text.trim()
            .parse()
            .map_err(|_| ProbeError::Parse(format!("bad integer in {name}: '{}'", text.trim())))
    }

    /// Resident set size in KiB. Zero means kernel thread.
    ///
    /// Field 2 of `statm` is the resident page count.
    pub fn rss_kib(&self, pid: i32) -> Result<i64, ProbeError> {
        let text = self.read_pid_file(pid, "statm")?;
        let pages: i64 = text
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProbeError::Parse(format!("bad statm: '{}'", text.trim())))?;
        Ok(pages * self.page_kib)
    }

    /// The process short name. The kernel truncates it to 15 bytes.
    pub fn comm(&self, pid: i32) -> Result<String, ProbeError> {
        let text = self.read_pid_file(pid, "comm")?;
        Ok(text.trim_end_matches('\n').to_string())
    }

    /// Real UID, taken from the owner of the PID directory.
    pub fn uid(&self, pid: i32) -> Result<u32, ProbeError> {
        let meta = fs::metadata(self.pid_path(pid))?;
        Ok(meta.uid())
    }

    /// CPU and wall times from the `stat` file.
    pub fn times(&self, pid: i32) -> Result<ProcessTimes, ProbeError> {
        let text = self.read_pid_file(pid, "stat")?;
        let fields = stat_fields(&text)?;
        // Fields after the comm, zero-based: state is 0, utime is 11,
        // stime 12, cutime 13, cstime 14, starttime 19.
        let tick_field = |idx: usize| -> Result<f64, ProbeError> {
            fields
                .get(idx)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| ProbeError::Parse(format!("bad stat field {idx}")))
        };
        let hz = self.ticks_per_sec;
        let starttime_secs = tick_field(19)? / hz;
        let runtime = (self.uptime()? - starttime_secs).max(0.0);
        Ok(ProcessTimes {
            utime: (tick_field(11)? / hz).round() as u64,
            stime: (tick_field(12)? / hz).round() as u64,
            cutime: (tick_field(13)? / hz).round() as u64,
            cstime: (tick_field(14)? / hz).round() as u64,
            runtime: runtime.round() as u64,
        })
    }

    /// Whether the process still runs. A zombie counts as dead: it has
    /// already exited and only waits for its parent to reap it, so waiting
    /// longer for it would be pointless.
    pub fn is_alive(&self, pid: i32) -> bool {
        let Ok(text) = self.read_pid_file(pid, "stat") else {
            return false;
        };
        match stat_fields(&text) {
            Ok(fields) => fields.first().map(String::as_str) != Some("Z"),
            Err(_) => false,
        }
    }

    /// Fresh memory snapshot from `<root>/meminfo`.
    pub fn meminfo(&self) -> Result<MemorySnapshot, ProbeError> {
        let text = fs::read_to_string(self.root.join("meminfo"))?;
        MemorySnapshot::parse(&text)
    }

    /// Seconds since boot, from `<root>/uptime`.
    pub fn uptime(&self) -> Result<f64, ProbeError> {
        let text = fs::read_to_string(self.root.join("uptime"))?;
        text.split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProbeError::Parse(format!("bad uptime: '{}'", text.trim())))
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a `stat` line into the fields following the comm.
///
/// The comm is enclosed in parentheses and may itself contain spaces and
/// parentheses, so the split happens at the last `)`.
fn stat_fields(text: &str) -> Result<Vec<String>, ProbeError> {
    let after = text
        .rfind(')')
        .map(|i| &text[i + 1..])
        .ok_or_else(|| ProbeError::Parse("stat line has no comm".into()))?;
    Ok(after.split_whitespace().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn ticks_per_sec() -> f64 {
        unsafe { libc::sysconf(libc::_SC_CLK_TCK) as f64 }
    }

    fn page_kib() -> i64 {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) / 1024 }
    }

    /// Build a fake procfs tree with one PID in it.
    fn fake_proc(pid: i32) -> (TempDir, ProcFs) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(pid.to_string())).unwrap();
        fs::write(dir.path().join("uptime"), "5000.00 12000.00\n").unwrap();
        let procfs = ProcFs::at(dir.path());
        (dir, procfs)
    }

    fn write_pid_file(dir: &TempDir, pid: i32, name: &str, content: &str) {
        fs::write(dir.path().join(pid.to_string()).join(name), content).unwrap();
    }

    #[test]
    fn test_pids_only_returns_numeric_entries() {
        let (dir, procfs) = fake_proc(42);
        fs::create_dir(dir.path().join("irq")).unwrap();
        fs::create_dir(dir.path().join("1x2")).unwrap();
        let pids = procfs.pids().unwrap();
        assert_eq!(pids, vec![42]);
    }

    #[test]
    fn test_oom_score_and_adj() {
        let (dir, procfs) = fake_proc(42);
        write_pid_file(&dir, 42, "oom_score", "123\n");
        write_pid_file(&dir, 42, "oom_score_adj", "-1000\n");
        assert_eq!(procfs.oom_score(42).unwrap(), 123);
        assert_eq!(procfs.oom_score_adj(42).unwrap(), -1000);
    }

    #[test]
    fn test_missing_pid_maps_to_not_found() {
        let (_dir, procfs) = fake_proc(42);
        assert!(matches!(procfs.oom_score(43), Err(ProbeError::NotFound)));
    }

    #[test]
    fn test_rss_scales_resident_pages() {
        let (dir, procfs) = fake_proc(42);
        write_pid_file(&dir, 42, "statm", "100 25 10 5 0 30 0\n");
        assert_eq!(procfs.rss_kib(42).unwrap(), 25 * page_kib());
    }

    #[test]
    fn test_comm_strips_trailing_newline() {
        let (dir, procfs) = fake_proc(42);
        write_pid_file(&dir, 42, "comm", "doveadm\n");
        assert_eq!(procfs.comm(42).unwrap(), "doveadm");
    }

    #[test]
    fn test_uid_is_directory_owner() {
        let (_dir, procfs) = fake_proc(42);
        let uid = procfs.uid(42).unwrap();
        assert_eq!(uid, nix::unistd::getuid().as_raw());
    }

    #[test]
    fn test_times_survive_spaces_in_comm() {
        let (dir, procfs) = fake_proc(42);
        let hz = ticks_per_sec();
        // utime 600 ticks, stime 300, cutime 0, cstime 0, starttime at
        // 100000 ticks after boot.
        let stat = format!(
            "42 (Web (Content)) S 1 42 42 0 -1 4194304 100 0 0 0 {} {} 0 0 20 0 1 0 {} 0 25 0",
            600, 300, 100_000
        );
        write_pid_file(&dir, 42, "stat", &stat);
        let times = procfs.times(42).unwrap();
        assert_eq!(times.utime, (600.0 / hz).round() as u64);
        assert_eq!(times.stime, (300.0 / hz).round() as u64);
        assert_eq!(times.cutime, 0);
        assert_eq!(times.cstime, 0);
        let expected_runtime = (5000.0 - 100_000.0 / hz).max(0.0).round() as u64;
        assert_eq!(times.runtime, expected_runtime);
    }

    #[test]
    fn test_runtime_clamps_to_zero() {
        let (dir, procfs) = fake_proc(42);
        let hz = ticks_per_sec();
        // Start time far beyond the recorded uptime.
        let starttime = (20_000.0 * hz) as u64;
        let stat = format!("42 (late) S 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 {starttime} 0 0 0");
        write_pid_file(&dir, 42, "stat", &stat);
        assert_eq!(procfs.times(42).unwrap().runtime, 0);
    }

    #[test]
    fn test_zombie_is_not_alive() {
        let (dir, procfs) = fake_proc(42);
        write_pid_file(&dir, 42, "stat", "42 (gone) Z 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 5 0 0 0");
        assert!(!procfs.is_alive(42));
    }

    #[test]
    fn test_running_process_is_alive() {
        let (dir, procfs) = fake_proc(42);
        write_pid_file(&dir, 42, "stat", "42 (busy) R 1 42 42 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 5 0 0 0");
        assert!(procfs.is_alive(42));
    }

    #[test]
    fn test_vanished_process_is_not_alive() {
        let (_dir, procfs) = fake_proc(42);
        assert!(!procfs.is_alive(99));
    }

    #[test]
    fn test_meminfo_reads_from_root() {
        let (dir, procfs) = fake_proc(42);
        fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 1000 kB\nMemAvailable: 600 kB\nSwapTotal: 500 kB\nSwapFree: 250 kB\n",
        )
        .unwrap();
        let m = procfs.meminfo().unwrap();
        assert!((m.mem_available_percent - 60.0).abs() < 1e-9);
        assert!((m.swap_free_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_uptime_parses_first_field() {
        let (_dir, procfs) = fake_proc(42);
        assert!((procfs.uptime().unwrap() - 5000.0).abs() < 1e-9);
    }
}
