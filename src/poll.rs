//! The polling control loop.
//!
//! One iteration: take a memory snapshot, decide, write the status file,
//! act, sleep. The decision itself is a pure function over the snapshot and
//! the carried state, so the threshold priorities, the hysteresis and the
//! emergency debounce can all be tested with fabricated snapshots and
//! virtual time.
//!
//! Time inside the loop is a slept-duration accumulator: the countdowns are
//! decremented by the duration the loop asked to sleep, never by wall
//! clock. Tests advance them the same way.

use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::kill::{kill_emergency, kill_largest_process};
use crate::meminfo::MemorySnapshot;
use crate::probe::ProcFs;
use crate::status;

/// Minimum quiet time between two emergency sweeps.
const EMERGENCY_TIMEOUT_MS: i64 = 30_000;

/// State carried across loop iterations. Nothing else survives an
/// iteration; per-process data is always re-read.
#[derive(Debug, Clone)]
pub struct ControlState {
    /// Last signal sent; kept while pressure recovers toward the high
    /// watermark.
    pub hysteresis_sig: Option<Signal>,
    /// Slept time remaining before another emergency sweep may fire.
    pub emergency_cooldown_ms: i64,
    /// Slept time until the next periodic memory report.
    pub report_countdown_ms: i64,
    /// The threshold that was crossed, for the status file.
    pub current_setpoint: f64,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            hysteresis_sig: None,
            emergency_cooldown_ms: 0,
            // Start expired so the first report prints immediately.
            report_countdown_ms: 0,
            current_setpoint: 0.0,
        }
    }

    /// Account for one sleep.
    pub fn advance(&mut self, slept_ms: i64) {
        self.report_countdown_ms -= slept_ms;
        if self.emergency_cooldown_ms > 0 {
            self.emergency_cooldown_ms -= slept_ms;
        }
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// What one iteration decided to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub sig: Option<Signal>,
    /// The emergency list, not a single victim, is the target.
    pub emergency: bool,
    /// Killing only because the high watermark has not been regained.
    pub high: bool,
}

/// Apply the threshold rules to one snapshot. First match wins.
pub fn decide(config: &Config, m: &MemorySnapshot, state: &mut ControlState) -> Decision {
    let mut decision = Decision {
        sig: None,
        emergency: false,
        high: false,
    };

    if !config.emerg_kill.is_empty()
        && state.emergency_cooldown_ms <= 0
        && m.mem_available_percent <= config.mem_emerg_percent
        && m.swap_free_percent <= config.swap_kill_percent
    {
        decision.sig = Some(Signal::SIGKILL);
        decision.emergency = true;
        state.current_setpoint = config.mem_emerg_percent;
        warn!(
            "EMERGENCY! at or below emergency limit: mem {:.2}%, swap {:.2}%",
            config.mem_emerg_percent, config.swap_kill_percent
        );
    } else if m.mem_available_percent <= config.mem_kill_percent
        && m.swap_free_percent <= config.swap_kill_percent
    {
        warn!("{}", m.summary());
        warn!(
            "low memory! at or below SIGKILL limits: mem {:.2}%, swap {:.2}%",
            config.mem_kill_percent, config.swap_kill_percent
        );
        decision.sig = Some(Signal::SIGKILL);
        state.current_setpoint = config.mem_kill_percent;
    } else if m.mem_available_percent <= config.mem_term_percent
        && m.swap_free_percent <= config.swap_term_percent
    {
        warn!("{}", m.summary());
        warn!(
            "low memory! at or below SIGTERM limits: mem {:.2}%, swap {:.2}%",
            config.mem_term_percent, config.swap_term_percent
        );
        decision.sig = Some(Signal::SIGTERM);
        state.current_setpoint = config.mem_term_percent;
    } else if let Some(held) = state.hysteresis_sig {
        if m.mem_available_percent <= config.mem_high_percent {
            warn!(
                "below high watermark ({:.2}%), continuing to kill processes",
                config.mem_high_percent
            );
            decision.sig = Some(held);
            decision.high = true;
            state.current_setpoint = config.mem_high_percent;
        } else {
            state.hysteresis_sig = None;
            state.current_setpoint = 0.0;
            warn!("{}", m.summary());
            warn!("recovery complete, available memory is above the high watermark");
        }
    }

    decision
}

/// How long to sleep when idle, from the headroom above the term limits.
///
/// Memory and swap can only fill so fast; the further away the limits are,
/// the longer the loop may sleep without missing a low-memory event. The
/// fill rates are worst-case observed values, in KiB per millisecond:
/// 6000 MiB/s for RAM and 800 MiB/s for swap.
pub fn sleep_time_ms(config: &Config, m: &MemorySnapshot) -> u64 {
    const MEM_FILL_RATE: i64 = 6000;
    const SWAP_FILL_RATE: i64 = 800;
    const MIN_SLEEP_MS: i64 = 100;
    const MAX_SLEEP_MS: i64 = 1000;

    let mem_headroom_kib = (((m.mem_available_percent - config.mem_term_percent)
        * 10.0
        * m.mem_total_mib() as f64) as i64)
        .max(0);
    let swap_headroom_kib = (((m.swap_free_percent - config.swap_term_percent)
        * 10.0
        * m.swap_total_mib() as f64) as i64)
        .max(0);

    let ms = mem_headroom_kib / MEM_FILL_RATE + swap_headroom_kib / SWAP_FILL_RATE;
    ms.clamp(MIN_SLEEP_MS, MAX_SLEEP_MS) as u64
}

/// Run the daemon forever.
pub fn poll_loop(config: &Config, procfs: &ProcFs) -> Result<()> {
    let mut state = ControlState::new();
    let status_path = Path::new(status::STATUS_FILENAME);

    loop {
        let m = match procfs.meminfo() {
            Ok(m) => m,
            Err(e) => {
                warn!("could not read meminfo, retrying in 1 second: {e}");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let decision = decide(config, &m, &mut state);
        status::update_status(
            status_path,
            decision.sig,
            decision.emergency,
            decision.high,
            m.mem_available_percent,
            state.current_setpoint,
        );

        let sleep_ms: u64;
        if let Some(sig) = decision.sig {
            if decision.emergency {
                kill_emergency(config, procfs)?;
                sleep_ms = 2000;
                state.emergency_cooldown_ms = EMERGENCY_TIMEOUT_MS;
            } else {
                let final_sig = kill_largest_process(config, procfs, Some(sig))?;
                sleep_ms = if final_sig == Some(Signal::SIGKILL) {
                    50
                } else {
                    500
                };
            }
            state.hysteresis_sig = Some(sig);
        } else {
            sleep_ms = sleep_time_ms(config, &m);
            if config.report_interval_ms > 0 && state.report_countdown_ms <= 0 {
                info!("{}", m.summary());
                state.report_countdown_ms = config.report_interval_ms as i64;
            }
        }

        debug!(sleep_ms, "sleeping");
        thread::sleep(Duration::from_millis(sleep_ms));
        state.advance(sleep_ms as i64);
    }
}
