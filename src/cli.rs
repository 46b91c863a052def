//! Command-line interface definitions using clap.
//!
//! Threshold options are collected as raw strings and parsed in
//! `config::parse_term_kill_tuple`, because their validation errors carry
//! dedicated exit codes that clap's own error path would swallow.

use std::path::PathBuf;

use clap::Parser;

/// oomward - early userspace out-of-memory daemon
#[derive(Parser, Debug, Default)]
#[command(name = "oomward")]
#[command(about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// Set available memory minimum to PERCENT of total (default 10).
    /// SIGTERM below PERCENT, SIGKILL below KILL_PERCENT (default PERCENT/2).
    #[arg(short = 'm', value_name = "PERCENT[,KILL_PERCENT]", allow_hyphen_values = true)]
    pub mem_percent: Option<String>,

    /// Set free swap minimum to PERCENT of total (default 10).
    /// Both memory and swap must be below their minimum for the daemon to act.
    #[arg(short = 's', value_name = "PERCENT[,KILL_PERCENT]", allow_hyphen_values = true)]
    pub swap_percent: Option<String>,

    /// Set available memory minimum to SIZE KiB.
    #[arg(short = 'M', value_name = "SIZE[,KILL_SIZE]", allow_hyphen_values = true)]
    pub mem_kib: Option<String>,

    /// Set free swap minimum to SIZE KiB.
    #[arg(short = 'S', value_name = "SIZE[,KILL_SIZE]", allow_hyphen_values = true)]
    pub swap_kib: Option<String>,

    /// Ignore positive oom_score_adj values.
    #[arg(short = 'i')]
    pub ignore_oom_score_adj: bool,

    /// Enable D-Bus notifications.
    #[arg(short = 'n')]
    pub notify: bool,

    /// Same as -n; the argument is accepted for compatibility and ignored.
    #[arg(short = 'N', value_name = "ARG")]
    pub notify_compat: Option<String>,

    /// Accepted and ignored (historical).
    #[arg(short = 'k', hide = true)]
    pub kernel_oom_compat: bool,

    /// Enable debugging messages.
    #[arg(short = 'd')]
    pub debug: bool,

    /// Print version information and exit.
    #[arg(short = 'v')]
    pub version: bool,

    /// Memory report interval in seconds (default 1), 0 disables completely.
    #[arg(short = 'r', value_name = "INTERVAL", allow_hyphen_values = true)]
    pub report_interval: Option<String>,

    /// Set own niceness to -20 and oom_score_adj to -100.
    #[arg(short = 'p')]
    pub set_priority: bool,

    /// Use the configuration file at PATH. Its values override flags.
    #[arg(short = 'c', value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Prefer to kill processes matching REGEX.
    #[arg(long, value_name = "REGEX")]
    pub prefer: Option<String>,

    /// Avoid killing processes matching REGEX.
    #[arg(long, value_name = "REGEX")]
    pub avoid: Option<String>,

    /// Dry run (do not kill any processes).
    #[arg(long)]
    pub dryrun: bool,
}
