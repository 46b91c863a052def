//! oomward - early userspace out-of-memory daemon
//!
//! Watches available memory and free swap, and starts killing processes
//! before the machine locks up in thrashing or the kernel OOM killer has
//! to step in.

mod cli;
mod config;
mod error;
mod kill;
mod logging;
mod meminfo;
mod notify;
mod poll;
mod probe;
mod selector;
mod status;

use clap::error::ErrorKind;
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{debug, info, warn, Level};

use cli::Cli;
use config::Config;
use error::{Result, SetupError};
use probe::ProcFs;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            let _ = e.print();
            eprintln!("Try 'oomward --help' for more information.");
            std::process::exit(13);
        }
    };

    if cli.version {
        println!("oomward {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    logging::init(if cli.debug { Level::DEBUG } else { Level::INFO });

    if let Err(e) = run(&cli) {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        std::process::exit(e.exit_code());
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Clean up notifier children, and die loudly if our own output pipe
    // breaks.
    notify::install_sigchld_reaper();
    install_sigpipe_handler();

    info!("oomward {}", env!("CARGO_PKG_VERSION"));

    std::env::set_current_dir("/proc").map_err(SetupError::ProcChdir)?;
    let procfs = ProcFs::new();
    let m = procfs
        .meminfo()
        .map_err(|e| SetupError::ProcOpen(e.to_string()))?;

    let mut config = Config::from_cli(cli, &m)?;
    if let Some(path) = &cli.config {
        config.apply_file(path)?;
    }
    if config.nice {
        raise_priority();
    }

    info!(
        "mem total: {:4} MiB, swap total: {:4} MiB",
        m.mem_total_mib(),
        m.swap_total_mib()
    );
    info!(
        "sending SIGTERM when mem <= {:.2}% and swap <= {:.2}%,",
        config.mem_term_percent, config.swap_term_percent
    );
    info!(
        "        SIGKILL when mem <= {:.2}% and swap <= {:.2}%",
        config.mem_kill_percent, config.swap_kill_percent
    );
    if config.mem_emerg_percent > 0.0 && !config.emerg_kill.is_empty() {
        info!(
            "      EMERGENCY when mem <= {:.2}% and swap <= {:.2}%",
            config.mem_emerg_percent, config.swap_kill_percent
        );
    }
    info!("writing status to file: {}", status::STATUS_FILENAME);
    status::ensure_status_dir();

    // One selection-and-signal-0 pass before locking memory: surfaces an
    // unusable /proc immediately and faults the stack in to full depth.
    debug!("dry-running victim selection...");
    kill::kill_largest_process(&config, &procfs, None)?;

    lock_memory();

    poll::poll_loop(&config, &procfs)
}

/// Make the daemon itself an unattractive and responsive neighbour: nice
/// -20 and oom_score_adj -100. Failures are logged and tolerated.
fn raise_priority() {
    let mut failed = false;
    // SAFETY: plain syscall, no pointers handed over.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, -20) };
    if ret != 0 {
        warn!(
            "could not set priority: {}, continuing anyway",
            std::io::Error::last_os_error()
        );
        failed = true;
    }
    let path = format!("/proc/{}/oom_score_adj", std::process::id());
    if let Err(e) = std::fs::write(path, "-100") {
        warn!("could not set oom_score_adj: {e}, continuing anyway");
        failed = true;
    }
    if !failed {
        info!("priority was raised successfully");
    }
}

/// Lock everything into RAM. A swapped-out OOM killer is no OOM killer.
fn lock_memory() {
    // SAFETY: no pointers involved.
    let mut ret =
        unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE | libc::MCL_ONFAULT) };
    if ret != 0 {
        // Kernels older than 4.4 do not support MCL_ONFAULT.
        ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    }
    if ret != 0 {
        warn!(
            "could not lock memory, continuing anyway: {}",
            std::io::Error::last_os_error()
        );
    }
}

extern "C" fn handle_sigpipe(_: libc::c_int) {
    // Async-signal-safe only: raw write and _exit.
    const MSG: &[u8] = b"oomward: SIGPIPE caught, aborting\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
        libc::_exit(99);
    }
}

/// A broken stderr means nobody can see what we kill. Treat it as fatal.
fn install_sigpipe_handler() {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigpipe),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only calls write and _exit.
    if let Err(e) = unsafe { sigaction(Signal::SIGPIPE, &action) } {
        warn!("could not install SIGPIPE handler: {e}");
    }
}
