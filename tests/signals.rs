//! Signal-handler behavior runs in its own test binary: the SIGCHLD reaper
//! is process-global and must not race the unit tests' own children.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use warden::signals;

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Reaped means the kernel dropped the process entirely; a zombie would
/// still show up under /proc in state Z.
fn process_gone(pid: Pid) -> bool {
    fs::metadata(format!("/proc/{pid}")).is_err()
}

#[test]
fn children_are_reaped_and_termination_sets_the_flag() {
    signals::setup_signals().expect("install signal handlers");

    // A burst of children exiting at once; SIGCHLD delivery must reap
    // every one of them without leaving zombies behind.
    let mut children = Vec::new();
    for _ in 0..8 {
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => unsafe { libc::_exit(0) },
            ForkResult::Parent { child } => children.push(child),
        }
    }
    for child in children {
        assert!(
            wait_until(Duration::from_secs(5), || process_gone(child)),
            "child {child} was not reaped"
        );
    }

    assert!(!signals::shutdown_requested());
    raise(Signal::SIGTERM).expect("raise SIGTERM");
    assert!(
        wait_until(Duration::from_secs(1), signals::shutdown_requested),
        "termination signal did not set the shutdown flag"
    );
}
