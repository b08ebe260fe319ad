//! Full lifecycle over the polling path: cold start spawns a child, a crash
//! restarts it, a shutdown wake stops the ingestion loop and joins every
//! worker. Runs in its own process because `run` installs global signal
//! handlers.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use warden::config::{CommandLine, Config, WatchConfig};
use warden::process;
use warden::supervisor::Supervisor;

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn cold_start_crash_restart_and_shutdown() {
    let pid_dir = tempfile::tempdir().expect("tempdir");

    let mut watches = BTreeMap::new();
    watches.insert(
        "sleeper".to_string(),
        WatchConfig {
            start: CommandLine::Argv(vec!["/bin/sleep".into(), "30".into()]),
            stop: None,
            dir: None,
            user: None,
            group: None,
            log_file: None,
            error_file: None,
        },
    );
    let config = Config {
        pid_dir: Some(pid_dir.path().to_path_buf()),
        poll_interval_secs: 1,
        poll_only: true,
        watches,
    };

    let mut supervisor = Supervisor::new(&config).expect("build supervisor");
    supervisor.init_watches().expect("init watches");
    let handle = supervisor.shutdown_handle();
    let record = supervisor.states()[0].clone();

    // The worker alone drives UNMONITORED -> STOPPED -> STARTING and
    // spawns, with no events flowing yet.
    assert!(
        wait_until(Duration::from_secs(5), || record.pid().as_raw() > 0),
        "no child was spawned"
    );
    let first = record.pid();
    assert!(process::is_running(first));
    assert!(
        wait_until(Duration::from_secs(5), || {
            pid_dir.path().join("sleeper.pid").exists()
        }),
        "PID file was not written"
    );

    let runner = thread::spawn(move || supervisor.run());

    // Crash the child; the poller observes the exit and the state machine
    // brings up a replacement.
    kill(first, Signal::SIGKILL).expect("kill child");
    assert!(
        wait_until(Duration::from_secs(10), || {
            let pid = record.pid();
            pid.as_raw() > 0 && pid != first && process::is_running(pid)
        }),
        "child was not restarted after the crash"
    );

    handle.request();
    let result = runner.join().expect("supervisor thread panicked");
    result.expect("supervisor run failed");

    // The supervisor does not kill children on shutdown (a successor can
    // adopt them through the PID file); clean up the survivor here.
    let survivor = record.pid();
    if survivor.as_raw() > 0 {
        let _ = kill(survivor, Signal::SIGKILL);
    }
}
