//! Runtime configuration.
//!
//! The immutable `Config` bundle is built once at startup from the command
//! line and (optionally) a configuration file, then passed by shared
//! reference to every subsystem. Nothing mutates it afterwards.
//!
//! The configuration file is line-oriented `key=value`. Values from the file
//! override values given on the command line.

use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::error::{Result, SetupError};
use crate::meminfo::MemorySnapshot;

/// Upper bound on the emergency victim list.
pub const EMERG_LIST_MAX: usize = 64;
/// Upper bound on one emergency victim name, in bytes.
pub const EMERG_NAME_MAX: usize = 32;

/// Everything the daemon needs to make decisions, fixed for its lifetime.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Kill until available memory rises above this watermark again.
    pub mem_high_percent: f64,
    pub mem_term_percent: f64,
    pub mem_kill_percent: f64,
    pub mem_emerg_percent: f64,
    pub swap_term_percent: f64,
    pub swap_kill_percent: f64,
    /// Subtract positive oom_score_adj values from the badness.
    pub ignore_oom_score_adj: bool,
    /// Send D-Bus notifications after kill attempts.
    pub notify: bool,
    /// Select victims but never signal them.
    pub dryrun: bool,
    /// Raise own priority and lower own oom_score_adj at startup.
    pub nice: bool,
    pub prefer_regex: Option<Regex>,
    pub avoid_regex: Option<Regex>,
    pub avoid_users: Option<Regex>,
    pub prefer_old: Option<Regex>,
    /// Periodic memory report interval; 0 disables the report.
    pub report_interval_ms: u64,
    /// Names killed en masse when pressure is catastrophic, in order.
    pub emerg_kill: Vec<String>,
}

impl Config {
    fn defaults() -> Self {
        Self {
            mem_high_percent: 15.0,
            mem_term_percent: 10.0,
            mem_kill_percent: 5.0,
            mem_emerg_percent: 0.0,
            swap_term_percent: 10.0,
            swap_kill_percent: 5.0,
            report_interval_ms: 1000,
            ..Self::default()
        }
    }

    /// Build the configuration from parsed command-line flags.
    ///
    /// `m` is the startup memory snapshot; the absolute `-M`/`-S` variants
    /// need the totals to convert KiB into percentages. When both the
    /// percentage and the absolute flag are given, the lower of the two
    /// resulting percentages wins.
    pub fn from_cli(cli: &Cli, m: &MemorySnapshot) -> Result<Self> {
        let mut config = Self::defaults();

        if let Some(arg) = &cli.mem_percent {
            let tuple = parse_term_kill_tuple(arg, 99.0)
                .map_err(|msg| SetupError::BadMemThreshold { flag: "-m", msg })?;
            config.mem_term_percent = tuple.term;
            config.mem_kill_percent = tuple.kill;
        }
        // Using "-s 100" is a valid way to ignore swap usage
        if let Some(arg) = &cli.swap_percent {
            let tuple = parse_term_kill_tuple(arg, 100.0)
                .map_err(|msg| SetupError::BadSwapThreshold { flag: "-s", msg })?;
            config.swap_term_percent = tuple.term;
            config.swap_kill_percent = tuple.kill;
        }
        if let Some(arg) = &cli.mem_kib {
            let upper = m.mem_total_kib as f64 * 100.0 / 99.0;
            let tuple = parse_term_kill_tuple(arg, upper)
                .map_err(|msg| SetupError::BadMemThreshold { flag: "-M", msg })?;
            let term_percent = 100.0 * tuple.term / m.mem_total_kib as f64;
            let kill_percent = 100.0 * tuple.kill / m.mem_total_kib as f64;
            if cli.mem_percent.is_some() {
                config.mem_term_percent = config.mem_term_percent.min(term_percent);
                config.mem_kill_percent = config.mem_kill_percent.min(kill_percent);
            } else {
                config.mem_term_percent = term_percent;
                config.mem_kill_percent = kill_percent;
            }
        }
        if let Some(arg) = &cli.swap_kib {
            if m.swap_total_kib == 0 {
                warn!("-S: total swap is zero, using default percentages");
            } else {
                let upper = m.swap_total_kib as f64 * 100.0 / 99.0;
                let tuple = parse_term_kill_tuple(arg, upper)
                    .map_err(|msg| SetupError::BadSwapThreshold { flag: "-S", msg })?;
                let term_percent = 100.0 * tuple.term / m.swap_total_kib as f64;
                let kill_percent = 100.0 * tuple.kill / m.swap_total_kib as f64;
                if cli.swap_percent.is_some() {
                    config.swap_term_percent = config.swap_term_percent.min(term_percent);
                    config.swap_kill_percent = config.swap_kill_percent.min(kill_percent);
                } else {
                    config.swap_term_percent = term_percent;
                    config.swap_kill_percent = kill_percent;
                }
            }
        }

        if cli.ignore_oom_score_adj {
            config.ignore_oom_score_adj = true;
            info!("ignoring positive oom_score_adj values (-i)");
        }
        if cli.notify {
            config.notify = true;
            info!("notifying through D-Bus");
        }
        if let Some(arg) = &cli.notify_compat {
            config.notify = true;
            info!("notifying through D-Bus, argument '{arg}' ignored for compatibility");
        }
        if cli.kernel_oom_compat {
            info!("option -k is ignored");
        }
        if let Some(arg) = &cli.report_interval {
            let seconds: f64 = arg
                .parse()
                .map_err(|_| SetupError::BadReportInterval(format!("invalid interval '{arg}'")))?;
            if seconds < 0.0 {
                return Err(SetupError::BadReportInterval(format!(
                    "invalid interval '{arg}'"
                )));
            }
            config.report_interval_ms = (seconds * 1000.0) as u64;
        }
        if cli.set_priority {
            config.nice = true;
        }
        if let Some(pattern) = &cli.prefer {
            config.prefer_regex = Some(compile_regex(pattern)?);
            info!("preferring to kill process names that match regex '{pattern}'");
        }
        if let Some(pattern) = &cli.avoid {
            config.avoid_regex = Some(compile_regex(pattern)?);
            info!("will avoid killing process names that match regex '{pattern}'");
        }
        if cli.dryrun {
            config.dryrun = true;
            warn!("dryrun mode enabled, will not kill anything");
        }

        Ok(config)
    }

    /// Overlay values from a configuration file.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        info!("loading configuration from {}", path.display());
        let text = fs::read_to_string(path).map_err(|source| SetupError::ConfigOpen {
            path: path.to_path_buf(),
            source,
        })?;

        for line in text.lines() {
            if line.len() < 2 || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "report_interval" => {
                    if let Some(seconds) = parse_number(key, value) {
                        self.report_interval_ms = (seconds.max(0.0) * 1000.0) as u64;
                    }
                }
                "nice" => self.nice = parse_bool(value),
                "ignore_oom_score_adj" => self.ignore_oom_score_adj = parse_bool(value),
                "notify_dbus" => self.notify = parse_bool(value),
                "memory_high" => apply_number(key, value, &mut self.mem_high_percent),
                "memory_low" => apply_number(key, value, &mut self.mem_term_percent),
                "memory_kill" => apply_number(key, value, &mut self.mem_kill_percent),
                "memory_emerg" => apply_number(key, value, &mut self.mem_emerg_percent),
                "swap_low" => apply_number(key, value, &mut self.swap_term_percent),
                "swap_kill" => apply_number(key, value, &mut self.swap_kill_percent),
                "prefer_regex" => {
                    self.prefer_regex = Some(compile_regex(value)?);
                    info!("preferring to kill process names that match regex '{value}'");
                }
                "avoid_regex" => {
                    self.avoid_regex = Some(compile_regex(value)?);
                    info!("will avoid killing process names that match regex '{value}'");
                }
                "avoid_users" => {
                    self.avoid_users = Some(compile_regex(value)?);
                    info!("will avoid killing processes owned by users that match regex '{value}'");
                }
                "prefer_old" => {
                    self.prefer_old = Some(compile_regex(value)?);
                    info!("preferring to kill old processes by age that match regex '{value}'");
                }
                "emerg_kill" => {
                    self.emerg_kill = parse_emerg_list(value);
                    info!(
                        "in case of emergency, will kill the following processes: {}",
                        self.emerg_kill.join(",")
                    );
                }
                _ => {
                    warn!("unrecognized config parameter '{key}'");
                    continue;
                }
            }
            debug!("config: set {key} = '{value}'");
        }
        Ok(())
    }
}

/// A `term[,kill]` threshold pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TermKillTuple {
    pub term: f64,
    pub kill: f64,
}

/// Parse a `term[,kill]` argument.
///
/// When only the term value is given, kill defaults to half of it. A term
/// value below the kill value is raised to it with a warning.
pub fn parse_term_kill_tuple(arg: &str, upper_limit: f64) -> Result<TermKillTuple, String> {
    let (term_str, kill_str) = match arg.split_once(',') {
        Some((t, k)) => (t, Some(k)),
        None => (arg, None),
    };
    let parse_one = |s: &str| -> Result<f64, String> {
        let value: f64 = s
            .trim()
            .parse()
            .map_err(|_| format!("could not parse '{s}'"))?;
        if value < 0.0 {
            return Err(format!("negative value '{s}'"));
        }
        if value > upper_limit {
            return Err(format!("value {value} exceeds limit {upper_limit:.0}"));
        }
        Ok(value)
    };
    let mut term = parse_one(term_str)?;
    let kill = match kill_str {
        Some(k) => parse_one(k)?,
        None => term / 2.0,
    };
    if term < kill {
        warn!("term value {term} is below kill value {kill}, setting term = kill");
        term = kill;
    }
    Ok(TermKillTuple { term, kill })
}

/// Parse the comma-separated emergency victim list. At most
/// [`EMERG_LIST_MAX`] names, each truncated to [`EMERG_NAME_MAX`] bytes.
pub fn parse_emerg_list(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = raw
        .split(',')
        .filter(|name| !name.is_empty())
        .map(truncate_name)
        .collect();
    if names.len() > EMERG_LIST_MAX {
        warn!(
            "emergency list has {} entries, only the first {} are used",
            names.len(),
            EMERG_LIST_MAX
        );
        names.truncate(EMERG_LIST_MAX);
    }
    names
}

fn truncate_name(name: &str) -> String {
    if name.len() <= EMERG_NAME_MAX {
        return name.to_string();
    }
    let mut end = EMERG_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| SetupError::BadRegex {
        pattern: pattern.to_string(),
        source,
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value.as_bytes().first(), Some(b'y') | Some(b'1'))
}

fn parse_number(key: &str, value: &str) -> Option<f64> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("config: could not parse {key}='{value}', keeping previous value");
            None
        }
    }
}

fn apply_number(key: &str, value: &str, slot: &mut f64) {
    if let Some(v) = parse_number(key, value) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn snapshot(mem_total_kib: i64, swap_total_kib: i64) -> MemorySnapshot {
        let text = format!(
            "MemTotal: {mem_total_kib} kB\nMemAvailable: {} kB\nSwapTotal: {swap_total_kib} kB\nSwapFree: {swap_total_kib} kB\n",
            mem_total_kib / 2
        );
        MemorySnapshot::parse(&text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_cli(&Cli::default(), &snapshot(1_000_000, 1_000_000)).unwrap();
        assert_eq!(config.mem_high_percent, 15.0);
        assert_eq!(config.mem_term_percent, 10.0);
        assert_eq!(config.mem_kill_percent, 5.0);
        assert_eq!(config.swap_term_percent, 10.0);
        assert_eq!(config.swap_kill_percent, 5.0);
        assert_eq!(config.report_interval_ms, 1000);
        assert!(!config.dryrun);
        assert!(config.emerg_kill.is_empty());
    }

    #[test]
    fn test_tuple_single_value_halves_kill() {
        let t = parse_term_kill_tuple("20", 99.0).unwrap();
        assert_eq!(t.term, 20.0);
        assert_eq!(t.kill, 10.0);
    }

    #[test]
    fn test_tuple_pair() {
        let t = parse_term_kill_tuple("12,4", 99.0).unwrap();
        assert_eq!(t.term, 12.0);
        assert_eq!(t.kill, 4.0);
    }

    #[test]
    fn test_tuple_term_raised_to_kill() {
        let t = parse_term_kill_tuple("5,8", 99.0).unwrap();
        assert_eq!(t.term, 8.0);
        assert_eq!(t.kill, 8.0);
    }

    #[test]
    fn test_tuple_rejects_garbage_negative_and_excess() {
        assert!(parse_term_kill_tuple("abc", 99.0).is_err());
        assert!(parse_term_kill_tuple("-5", 99.0).is_err());
        assert!(parse_term_kill_tuple("150", 99.0).is_err());
        assert!(parse_term_kill_tuple("10,", 99.0).is_err());
        assert!(parse_term_kill_tuple("10,120", 99.0).is_err());
    }

    #[test]
    fn test_mem_kib_alone_sets_percentages() {
        let cli = Cli {
            mem_kib: Some("100000".into()),
            ..Cli::default()
        };
        let config = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap();
        assert!((config.mem_term_percent - 10.0).abs() < 1e-9);
        assert!((config.mem_kill_percent - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_mem_percent_and_kib_merge_takes_minimum() {
        let cli = Cli {
            mem_percent: Some("20,10".into()),
            mem_kib: Some("50000".into()),
            ..Cli::default()
        };
        // 50000 KiB of 1000000 KiB is 5 %, lower than the 20 % from -m.
        let config = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap();
        assert!((config.mem_term_percent - 5.0).abs() < 1e-9);
        assert!((config.mem_kill_percent - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_swap_kib_ignored_without_swap() {
        let cli = Cli {
            swap_kib: Some("100000".into()),
            ..Cli::default()
        };
        let config = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap();
        assert_eq!(config.swap_term_percent, 10.0);
        assert_eq!(config.swap_kill_percent, 5.0);
    }

    #[test]
    fn test_report_interval_seconds_to_ms() {
        let cli = Cli {
            report_interval: Some("2.5".into()),
            ..Cli::default()
        };
        let config = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap();
        assert_eq!(config.report_interval_ms, 2500);
    }

    #[test]
    fn test_report_interval_rejects_garbage_and_negative() {
        for bad in ["x", "-1"] {
            let cli = Cli {
                report_interval: Some(bad.into()),
                ..Cli::default()
            };
            let err = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap_err();
            assert_eq!(err.exit_code(), 14);
        }
    }

    #[test]
    fn test_bad_cli_regex_exit_code() {
        let cli = Cli {
            prefer: Some("(".into()),
            ..Cli::default()
        };
        let err = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_file_overrides_cli() {
        let cli = Cli {
            mem_percent: Some("20,10".into()),
            ..Cli::default()
        };
        let mut config = Config::from_cli(&cli, &snapshot(1_000_000, 0)).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "; another comment").unwrap();
        writeln!(file, "memory_low=7.5").unwrap();
        writeln!(file, "memory_kill=3").unwrap();
        writeln!(file, "notify_dbus=yes").unwrap();
        writeln!(file, "nice=1").unwrap();
        writeln!(file, "report_interval=5").unwrap();
        writeln!(file, "emerg_kill=doveadm,php-cgi").unwrap();
        writeln!(file, "no_equals_sign_line").unwrap();
        writeln!(file, "some_unknown_key=1").unwrap();
        config.apply_file(file.path()).unwrap();

        assert_eq!(config.mem_term_percent, 7.5);
        assert_eq!(config.mem_kill_percent, 3.0);
        assert!(config.notify);
        assert!(config.nice);
        assert_eq!(config.report_interval_ms, 5000);
        assert_eq!(config.emerg_kill, vec!["doveadm", "php-cgi"]);
    }

    #[test]
    fn test_file_regex_keys() {
        let mut config = Config::defaults();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prefer_regex=^chrome$").unwrap();
        writeln!(file, "avoid_users=^(root|postgres)$").unwrap();
        writeln!(file, "prefer_old=^backupd$").unwrap();
        config.apply_file(file.path()).unwrap();
        assert!(config.prefer_regex.unwrap().is_match("chrome"));
        assert!(config.avoid_users.unwrap().is_match("postgres"));
        assert!(config.prefer_old.unwrap().is_match("backupd"));
    }

    #[test]
    fn test_file_bad_regex_is_fatal() {
        let mut config = Config::defaults();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "prefer_regex=(").unwrap();
        let err = config.apply_file(file.path()).unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let mut config = Config::defaults();
        let err = config
            .apply_file(Path::new("/nonexistent/oomward.conf"))
            .unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn test_emerg_list_limits() {
        let raw = vec!["x"; 70].join(",");
        assert_eq!(parse_emerg_list(&raw).len(), EMERG_LIST_MAX);

        let long = "a".repeat(40);
        let names = parse_emerg_list(&long);
        assert_eq!(names[0].len(), EMERG_NAME_MAX);

        assert!(parse_emerg_list("").is_empty());
    }

    #[test]
    fn test_bool_values() {
        assert!(parse_bool("yes"));
        assert!(parse_bool("y"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("no"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }
}
