//! Fire-and-forget desktop notifications.
//!
//! A short-lived child invokes `dbus-send` against the system bus. The
//! daemon never waits for it and never learns whether it worked: when the
//! machine is deep in swap, blocking on a notification helper is the last
//! thing an OOM responder should do. A SIGCHLD handler reaps the children
//! so they do not linger as zombies.

use std::process::{Command, Stdio};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::warn;

const DBUS_SEND: &str = "/usr/bin/dbus-send";
const DBUS_TARGET: &str = "net.nuetzlich.SystemNotifications.Notify";

/// Spawn the notification helper and forget about it.
pub fn notify(summary: &str, body: &str) {
    let result = Command::new(DBUS_SEND)
        .arg("--system")
        .arg("/")
        .arg(DBUS_TARGET)
        .arg(format!("string:{summary}"))
        .arg(format!("string:{body}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match result {
        // The SIGCHLD handler reaps it.
        Ok(child) => drop(child),
        Err(e) => warn!("notify: spawning {DBUS_SEND} failed: {e}"),
    }
}

extern "C" fn handle_sigchld(_: libc::c_int) {
    // Async-signal-safe: waitpid only, no allocation, no locks.
    unsafe {
        while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
    }
}

/// Install the reaper for notification children.
pub fn install_sigchld_reaper() {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only calls waitpid, which is async-signal-safe.
    if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &action) } {
        warn!("could not install SIGCHLD handler: {e}");
    }
}
