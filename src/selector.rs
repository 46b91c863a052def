//! Victim selection: one streaming pass over the process table.
//!
//! Every candidate gets an integer badness score seeded from the kernel's
//! `oom_score` and adjusted by the configured regex and user rules. The
//! scan keeps a single running best instead of sorting globally, so one
//! pass over `/proc` suffices and expensive per-process reads only happen
//! for candidates that can still win.

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SetupError};
use crate::probe::{ProcFs, ProcessTimes};

const BADNESS_PREFER: i64 = 300;
const BADNESS_AVOID: i64 = -300;
const BADNESS_AVOID_USER: i64 = -150;
const BADNESS_AGE_DIV: u64 = 600;

/// The process chosen to die.
#[derive(Debug, Clone, Default)]
pub struct Victim {
    pub pid: i32,
    pub uid: u32,
    pub badness: i64,
    pub rss_kib: i64,
    pub name: String,
    pub username: String,
    pub utime: u64,
    pub stime: u64,
    pub rtime: u64,
}

/// Scan the whole process table and pick at most one victim.
///
/// Returns `None` when no candidate survives filtering, and also when the
/// scan only turned up the daemon itself (procfs mounted with hidepid).
pub fn select_victim(config: &Config, procfs: &ProcFs) -> Result<Option<Victim>> {
    let pids = procfs
        .pids()
        .map_err(|e| SetupError::ProcOpen(e.to_string()))?;
    Ok(select_among(config, procfs, pids))
}

/// The selection pass itself, over an explicit candidate order.
///
/// A candidate replaces the current best only if its badness is strictly
/// higher, or equal with a strictly larger RSS. The first surviving
/// candidate becomes the initial best, so on a full tie the first one seen
/// wins.
fn select_among(
    config: &Config,
    procfs: &ProcFs,
    pids: impl IntoIterator<Item = i32>,
) -> Option<Victim> {
    let self_pid = std::process::id() as i32;
    let wants_name =
        config.prefer_regex.is_some() || config.avoid_regex.is_some() || config.prefer_old.is_some();

    let mut best: Option<Victim> = None;
    let mut candidates: u32 = 0;

    for pid in pids {
        if pid <= 1 {
            // Let's not kill init.
            continue;
        }

        let mut badness = match procfs.oom_score(pid) {
            Ok(score) => score,
            Err(e) => {
                debug!(pid, "error reading oom_score: {e}");
                continue;
            }
        };
        if config.ignore_oom_score_adj {
            match procfs.oom_score_adj(pid) {
                Ok(adj) if adj > 0 => badness -= adj,
                Ok(_) => {}
                Err(e) => {
                    debug!(pid, "error reading oom_score_adj: {e}");
                    continue;
                }
            }
        }

        // Times are re-read for every candidate so that an earlier read
        // can never leak into a later one.
        let times: Option<ProcessTimes> = if config.prefer_old.is_some() {
            procfs.times(pid).ok()
        } else {
            None
        };

        let mut name = String::new();
        if wants_name {
            name = match procfs.comm(pid) {
                Ok(name) => name,
                Err(e) => {
                    debug!(pid, "error reading process name: {e}");
                    continue;
                }
            };
            if let Some(regex) = &config.prefer_regex {
                if regex.is_match(&name) {
                    badness += BADNESS_PREFER;
                }
            }
            if let Some(regex) = &config.avoid_regex {
                if regex.is_match(&name) {
                    badness += BADNESS_AVOID;
                }
            }
            if let Some(regex) = &config.prefer_old {
                if regex.is_match(&name) {
                    if let Some(times) = &times {
                        badness += (times.runtime / BADNESS_AGE_DIV) as i64;
                    }
                }
            }
        }

        let mut uid: Option<u32> = None;
        let mut username = String::new();
        if let Some(regex) = &config.avoid_users {
            let owner = match procfs.uid(pid) {
                Ok(owner) => owner,
                Err(e) => {
                    debug!(pid, "error reading uid: {e}");
                    continue;
                }
            };
            match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(owner)) {
                Ok(Some(user)) => {
                    if regex.is_match(&user.name) {
                        badness += BADNESS_AVOID_USER;
                    }
                    uid = Some(owner);
                    username = user.name;
                }
                Ok(None) | Err(_) => {
                    debug!(pid, owner, "error looking up user");
                    continue;
                }
            }
        }

        candidates += 1;
        debug!(pid, badness, "scored candidate");

        if let Some(victim) = &best {
            if badness < victim.badness {
                continue;
            }
        }

        // Only candidates that can still win pay for the remaining reads.
        let rss_kib = match procfs.rss_kib(pid) {
            Ok(rss) => rss,
            Err(e) => {
                debug!(pid, "error reading rss: {e}");
                continue;
            }
        };
        if rss_kib == 0 {
            // Kernel threads have zero rss
            continue;
        }
        if let Some(victim) = &best {
            if badness == victim.badness && rss_kib <= victim.rss_kib {
                continue;
            }
        }

        // Skip processes with oom_score_adj = -1000, like the kernel oom
        // killer would. Checked fresh, the value may have changed since
        // the scan started.
        match procfs.oom_score_adj(pid) {
            Ok(-1000) => continue,
            Ok(_) => {}
            Err(e) => {
                debug!(pid, "error reading oom_score_adj: {e}");
                continue;
            }
        }

        if name.is_empty() {
            name = match procfs.comm(pid) {
                Ok(name) => name,
                Err(e) => {
                    debug!(pid, "error reading process name: {e}");
                    continue;
                }
            };
        }
        let uid = match uid {
            Some(uid) => uid,
            None => match procfs.uid(pid) {
                Ok(uid) => uid,
                Err(e) => {
                    debug!(pid, "error reading uid: {e}");
                    continue;
                }
            },
        };

        let (utime, stime, rtime) = times
            .map(|t| (t.utime, t.stime, t.runtime))
            .unwrap_or_default();
        debug!(pid, uid, badness, rss_kib, name = %name, "new victim");
        best = Some(Victim {
            pid,
            uid,
            badness,
            rss_kib,
            name,
            username,
            utime,
            stime,
            rtime,
        });
    }

    if candidates <= 1 {
        if let Some(victim) = &best {
            if victim.pid == self_pid {
                warn!(
                    pid = victim.pid,
                    "only found myself in the process table, is procfs mounted with hidepid?"
                );
                return None;
            }
        }
    }
    debug!(candidates, "selection pass finished");
    best
}
