//! Signalling victims: graceful kill, escalation and the emergency sweep.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SetupError};
use crate::meminfo::MemorySnapshot;
use crate::notify::notify;
use crate::probe::ProcFs;
use crate::selector::select_victim;

/// Escalate a SIGTERM to SIGKILL after this long.
const SIGTERM_WAIT_SECS: f64 = 6.0;
/// Victim poll cadence while waiting for it to exit.
const KILL_TICK: Duration = Duration::from_millis(100);
/// Give up after this many ticks.
const KILL_TICKS: u32 = 100;

#[derive(Error, Debug)]
pub enum KillError {
    #[error("timed out waiting for process {0} to exit")]
    Timeout(i32),
    #[error("kill failed: {0}")]
    Signal(Errno),
}

/// Whether a pending SIGTERM should be escalated to SIGKILL.
///
/// Either the grace period ran out, or memory dropped through the kill
/// watermark while we were being polite.
fn should_escalate(elapsed_secs: f64, m: &MemorySnapshot, config: &Config) -> bool {
    elapsed_secs >= SIGTERM_WAIT_SECS
        || (m.mem_available_percent <= config.mem_kill_percent
            && m.swap_free_percent <= config.swap_kill_percent)
}

fn send(pid: Pid, sig: Option<Signal>) -> Result<bool, KillError> {
    match kill(pid, sig) {
        Ok(()) => Ok(true),
        // Already gone, which is all we wanted.
        Err(Errno::ESRCH) => Ok(false),
        Err(Errno::EPERM) => {
            // Retrying immediately would fail the same way and spam the
            // log. Throttle before handing the error back.
            warn!("no permission to signal process {pid}, sleeping 1 second");
            thread::sleep(Duration::from_secs(1));
            Err(KillError::Signal(Errno::EPERM))
        }
        Err(e) => Err(KillError::Signal(e)),
    }
}

/// Send `sig` to `pid` and wait for the process to exit (max 10 seconds).
///
/// Returns the signal that finally went out, which is SIGKILL when the wait
/// escalated. A `None` signal is the startup self-test: the syscall result
/// is returned without waiting.
pub fn kill_wait(
    config: &Config,
    procfs: &ProcFs,
    pid: i32,
    sig: Option<Signal>,
) -> Result<Option<Signal>, KillError> {
    if config.dryrun && sig.is_some() {
        warn!("dryrun, not actually sending any signal");
        return Ok(sig);
    }
    let target = Pid::from_raw(pid);
    if !send(target, sig)? {
        return Ok(sig);
    }
    let Some(mut current) = sig else {
        return Ok(None);
    };

    for tick in 0..KILL_TICKS {
        let elapsed_secs = (tick * 100) as f64 / 1000.0;
        if current != Signal::SIGKILL {
            // We have sent SIGTERM but may since have dropped below the
            // SIGKILL limits.
            if let Ok(m) = procfs.meminfo() {
                debug!("{}", m.summary());
                if should_escalate(elapsed_secs, &m, config) {
                    current = Signal::SIGKILL;
                    let delivered = send(target, Some(current))?;
                    warn!("escalating to SIGKILL after {elapsed_secs:.1} seconds");
                    if !delivered {
                        return Ok(Some(current));
                    }
                }
            }
        }
        if !procfs.is_alive(pid) {
            warn!("process {pid} exited after {elapsed_secs:.1} seconds");
            return Ok(Some(current));
        }
        thread::sleep(KILL_TICK);
    }
    Err(KillError::Timeout(pid))
}

/// Find the process with the highest badness and kill it.
///
/// Returns the signal that was finally delivered, so the caller can adapt
/// its next sleep. `None` means no victim was found (or this was the
/// self-test pass).
pub fn kill_largest_process(
    config: &Config,
    procfs: &ProcFs,
    sig: Option<Signal>,
) -> Result<Option<Signal>> {
    let scan_start = Instant::now();
    let victim = select_victim(config, procfs)?;
    let Some(victim) = victim else {
        warn!("could not find a process to kill, sleeping 1 second");
        if config.notify {
            notify("oomward", "Error: could not find a process to kill");
        }
        thread::sleep(Duration::from_secs(1));
        return Ok(None);
    };
    debug!(elapsed = ?scan_start.elapsed(), "victim selection finished");

    if let Some(sig) = sig {
        warn!(
            pid = victim.pid,
            uid = victim.uid,
            user = %victim.username,
            name = %victim.name,
            badness = victim.badness,
            rss_mib = victim.rss_kib / 1024,
            rtime = victim.rtime,
            utime = victim.utime,
            stime = victim.stime,
            "sending {}",
            sig.as_str()
        );
    } else {
        debug!(
            pid = victim.pid,
            name = %victim.name,
            badness = victim.badness,
            "sending signal 0 (self-test)"
        );
    }

    let result = kill_wait(config, procfs, victim.pid, sig);

    // Notify only after the kill attempt: that way the machine is more
    // likely to have the memory to spawn the helper.
    if sig.is_some() && config.notify {
        notify(
            "oomward",
            &format!("Low memory! Killing process {} {}", victim.pid, victim.name),
        );
    }

    match result {
        Ok(final_sig) => Ok(final_sig),
        Err(e) => {
            warn!("kill failed: {e}");
            if config.notify {
                notify("oomward", "Error: failed to kill process");
            }
            Ok(sig)
        }
    }
}

/// SIGKILL every process whose name matches the configured emergency list.
///
/// Names are processed in order. Before each one, memory is re-checked and
/// the sweep stops as soon as the high watermark is regained. Matching is
/// byte-exact on the kernel-truncated comm, and dryrun is deliberately not
/// honoured here.
pub fn kill_emergency(config: &Config, procfs: &ProcFs) -> Result<u32> {
    let mut kills: u32 = 0;

    for name in &config.emerg_kill {
        match procfs.meminfo() {
            Ok(m) if m.mem_available_percent > config.mem_high_percent => break,
            Ok(_) => {}
            Err(e) => {
                warn!("emergency: could not re-read meminfo: {e}");
                break;
            }
        }
        warn!(name = %name, "emergency: killing all processes with this name");

        let pids = procfs
            .pids()
            .map_err(|e| SetupError::ProcOpen(e.to_string()))?;
        for pid in pids {
            if pid <= 1 {
                continue;
            }
            let Ok(comm) = procfs.comm(pid) else {
                continue;
            };
            if comm == *name {
                debug!(pid, name = %name, "emergency: sending SIGKILL");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                kills += 1;
            }
        }
    }

    warn!(kills, "emergency sweep finished");
    Ok(kills)
}
