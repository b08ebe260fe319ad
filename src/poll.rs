use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::Context;
use nix::unistd::Pid;
use tracing::info;

use crate::event;
use crate::process;
use crate::signals;
use crate::supervisor::Supervisor;

pub type PollHandler = fn(Pid, bool, &Supervisor);

/// Fallback liveness loop for hosts where the process connector is not
/// available: probe every known child each interval and feed the results to
/// the dispatch layer. Between rounds the loop sleeps on the shutdown
/// descriptor so a shutdown request wakes it within one interval.
pub fn poll_loop(
    supervisor: &Supervisor,
    interval: Duration,
    handler: PollHandler,
) -> anyhow::Result<()> {
    let wake_fd = supervisor.shutdown_descriptor().as_raw_fd();
    let timeout_ms = interval.as_millis().min(i32::MAX as u128) as libc::c_int;

    info!(interval_secs = interval.as_secs(), "starting liveness poll loop");

    while !signals::shutdown_requested() {
        for record in supervisor.states() {
            let pid = record.pid();
            if pid.as_raw() < 1 {
                continue;
            }
            handler(pid, process::is_running(pid), supervisor);
        }

        let mut fds = [libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err).context("wait between poll rounds");
        }
        if rc > 0 && (fds[0].revents & libc::POLLIN) != 0 {
            event::drain_shutdown_wake(wake_fd);
            signals::request_shutdown();
        }
    }

    Ok(())
}
