use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use nix::unistd::{getpid, Pid};
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::event;
use crate::poll;
use crate::signals;
use crate::state::{self, State, StateRecord};
use crate::watch::Watch;

/// Top-level runtime: the watch set, one state record per watch, and the
/// descriptors shared with the ingestion loops.
///
/// The supervisor owns every record and strictly outlives the workers it
/// joins during shutdown.
pub struct Supervisor {
    watches: BTreeMap<String, Arc<Watch>>,
    states: Vec<Arc<StateRecord>>,
    pid_dir: PathBuf,
    self_pid: Pid,
    event_fd: Arc<OwnedFd>,
    poll_interval: Duration,
    poll_only: bool,
}

/// Clonable handle other threads use to request an orderly shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    fd: Arc<OwnedFd>,
}

impl ShutdownHandle {
    /// Wake the ingestion loop; it drains the value and begins shutdown.
    pub fn request(&self) {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&value as *const u64).cast(),
                mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            warn!(
                "failed to write shutdown descriptor: {}",
                io::Error::last_os_error()
            );
        }
    }
}

impl Supervisor {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let pid_dir = config::determine_pid_dir(config.pid_dir.as_deref())?;

        let mut watches = BTreeMap::new();
        for (name, watch_config) in &config.watches {
            let watch = Watch::from_config(name, watch_config)?;
            watches.insert(name.clone(), Arc::new(watch));
        }

        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("create shutdown descriptor");
        }

        Ok(Self {
            watches,
            states: Vec::new(),
            pid_dir,
            self_pid: getpid(),
            event_fd: Arc::new(unsafe { OwnedFd::from_raw_fd(fd) }),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_only: config.poll_only,
        })
    }

    pub fn watches(&self) -> &BTreeMap<String, Arc<Watch>> {
        &self.watches
    }

    pub fn states(&self) -> &[Arc<StateRecord>] {
        &self.states
    }

    pub fn pid_dir(&self) -> &Path {
        &self.pid_dir
    }

    pub fn self_pid(&self) -> Pid {
        self.self_pid
    }

    pub fn shutdown_descriptor(&self) -> &OwnedFd {
        &self.event_fd
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            fd: Arc::clone(&self.event_fd),
        }
    }

    /// Create one state record and one worker thread per watch. The worker
    /// immediately consumes the wake permit seeded at construction and
    /// derives the watch's initial state.
    pub fn init_watches(&mut self) -> anyhow::Result<()> {
        for watch in self.watches.values() {
            debug!(watch = %watch.name, "initializing watch");
            let record = Arc::new(StateRecord::new(Arc::clone(watch), self.pid_dir.clone()));

            let worker = {
                let record = Arc::clone(&record);
                thread::Builder::new()
                    .name(format!("state-{}", watch.name))
                    .spawn(move || state::state_loop(&record))
                    .with_context(|| format!("spawn worker thread for watch '{}'", watch.name))?
            };
            record.attach_worker(worker);
            self.states.push(record);
        }
        Ok(())
    }

    /// Run event ingestion on the calling thread until shutdown, then stop
    /// every worker. Falls back to liveness polling when the process
    /// connector cannot be opened.
    pub fn run(&self) -> anyhow::Result<()> {
        signals::setup_signals()?;

        let result = if self.poll_only {
            poll::poll_loop(self, self.poll_interval, state::dispatch_poll_result)
        } else {
            match event::netlink_connect(self.self_pid) {
                Ok(socket) => event::event_loop(socket, self, state::dispatch_event),
                Err(err) => {
                    warn!("process connector unavailable, falling back to liveness polling: {err:#}");
                    poll::poll_loop(self, self.poll_interval, state::dispatch_poll_result)
                }
            }
        };

        self.stop_watches();
        result
    }

    /// Write QUIT to every record, wake every worker, join every worker.
    fn stop_watches(&self) {
        for record in &self.states {
            record.set_state(State::Quit);
        }
        for record in &self.states {
            let Some(worker) = record.take_worker() else {
                continue;
            };
            debug!(watch = %record.watch.name, "waiting for state thread to terminate");
            if worker.join().is_err() {
                error!(watch = %record.watch.name, "state thread panicked");
            }
        }
        info!("all watches stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandLine, WatchConfig};
    use crate::event::ProcessEvent;
    use crate::state::{dispatch_event, dispatch_poll_result};

    fn one_watch_config(pid_dir: &Path) -> Config {
        let mut watches = BTreeMap::new();
        watches.insert(
            "app".to_string(),
            WatchConfig {
                start: CommandLine::Line("/bin/sleep 30".into()),
                stop: None,
                dir: None,
                user: None,
                group: None,
                log_file: None,
                error_file: None,
            },
        );
        Config {
            pid_dir: Some(pid_dir.to_path_buf()),
            poll_interval_secs: 1,
            poll_only: true,
            watches,
        }
    }

    /// Builds a supervisor with one record and no worker thread, so wake
    /// posts stay observable.
    fn supervisor_with_record(pid_dir: &Path) -> Supervisor {
        let config = one_watch_config(pid_dir);
        let mut supervisor = Supervisor::new(&config).unwrap();
        let watch = Arc::clone(&supervisor.watches["app"]);
        supervisor
            .states
            .push(Arc::new(StateRecord::new(watch, pid_dir.to_path_buf())));
        supervisor
    }

    #[test]
    fn poll_dispatch_posts_only_on_state_changes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_record(dir.path());
        let record = &supervisor.states[0];

        record.set_pid(Pid::from_raw(4242));
        record.set_state(State::Running);
        let pending = record.wake.pending();

        // Already RUNNING: no write, no post.
        dispatch_poll_result(Pid::from_raw(4242), true, &supervisor);
        assert_eq!(record.state(), State::Running);
        assert_eq!(record.wake.pending(), pending);

        // Dead now: one write, one post.
        dispatch_poll_result(Pid::from_raw(4242), false, &supervisor);
        assert_eq!(record.state(), State::Stopped);
        assert_eq!(record.wake.pending(), pending + 1);

        // Unknown PID: nothing matches, nothing happens.
        dispatch_poll_result(Pid::from_raw(9999), true, &supervisor);
        assert_eq!(record.state(), State::Stopped);
        assert_eq!(record.wake.pending(), pending + 1);
    }

    #[test]
    fn event_dispatch_derives_states_from_exit_and_fork() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_record(dir.path());
        let record = &supervisor.states[0];

        record.set_pid(Pid::from_raw(77));
        record.set_state(State::Starting);
        let pending = record.wake.pending();

        // A fork by the child confirms it alive.
        let fork = ProcessEvent::Fork {
            parent_pid: 77,
            parent_tgid: 77,
            child_pid: 78,
            child_tgid: 78,
        };
        dispatch_event(Pid::from_raw(77), &fork, &supervisor);
        assert_eq!(record.state(), State::Running);
        assert_eq!(record.wake.pending(), pending + 1);

        // Its exit records STOPPED; a repeat is idempotent.
        let exit = ProcessEvent::Exit {
            pid: 77,
            tgid: 77,
            exit_code: 0,
            exit_signal: 17,
        };
        dispatch_event(Pid::from_raw(77), &exit, &supervisor);
        assert_eq!(record.state(), State::Stopped);
        assert_eq!(record.wake.pending(), pending + 2);
        dispatch_event(Pid::from_raw(77), &exit, &supervisor);
        assert_eq!(record.wake.pending(), pending + 2);
    }
}
