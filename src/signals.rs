use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

// Single cross-boundary signal-safe variable: set by the termination
// handlers, read by the ingestion loops.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// True once SIGTERM/SIGINT arrived or a shutdown wake was drained.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub(crate) fn reset_shutdown() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

/// Reap terminated children without blocking. Handlers may only make
/// async-signal-safe calls, and `errno` belongs to the interrupted context.
extern "C" fn handle_child_stop(_signum: libc::c_int) {
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
        *errno = saved;
    }
}

extern "C" fn handle_terminate(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the SIGCHLD reaper and the SIGTERM/SIGINT termination handlers.
/// All signals are blocked while a handler runs; interrupted syscalls
/// restart and child stops are not reported.
pub fn setup_signals() -> anyhow::Result<()> {
    let reap = SigAction::new(
        SigHandler::Handler(handle_child_stop),
        SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
        SigSet::all(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &reap) }.context("install SIGCHLD handler")?;

    let terminate = SigAction::new(
        SigHandler::Handler(handle_terminate),
        SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
        SigSet::all(),
    );
    unsafe { sigaction(Signal::SIGTERM, &terminate) }.context("install SIGTERM handler")?;
    unsafe { sigaction(Signal::SIGINT, &terminate) }.context("install SIGINT handler")?;

    Ok(())
}
