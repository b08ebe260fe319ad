use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::event::ProcessEvent;
use crate::process;
use crate::supervisor::Supervisor;
use crate::wake::Wake;
use crate::watch::Watch;

/// Supervision states of a single watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Unmonitored,
    Starting,
    Running,
    Stopping,
    Stopped,
    Quit,
}

pub const STATE_COUNT: usize = 7;

impl State {
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Init => "init",
            State::Unmonitored => "unmonitored",
            State::Starting => "starting",
            State::Running => "running",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Quit => "quit",
        })
    }
}

/// Mutable per-watch runtime bundle.
///
/// `state` is written by the dispatch layer, by transition actions and by
/// the supervisor (QUIT), always under the "write then post" discipline;
/// only the owning worker reads it to drive transitions. `pid` is written
/// only by the owning worker and read by the dispatch layer.
pub struct StateRecord {
    pub watch: Arc<Watch>,
    state: Mutex<State>,
    pid: AtomicI32,
    pub wake: Wake,
    worker: Mutex<Option<JoinHandle<()>>>,
    pid_dir: PathBuf,
}

impl StateRecord {
    pub fn new(watch: Arc<Watch>, pid_dir: PathBuf) -> Self {
        Self {
            watch,
            state: Mutex::new(State::Unmonitored),
            pid: AtomicI32::new(0),
            wake: Wake::new(),
            worker: Mutex::new(None),
            pid_dir,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a new target state and wake the owning worker.
    pub fn set_state(&self, value: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = value;
        self.wake.post();
    }

    /// Put a state back after a failed transition, without waking anyone.
    fn restore_state(&self, value: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid.load(Ordering::SeqCst))
    }

    pub fn set_pid(&self, pid: Pid) {
        self.pid.store(pid.as_raw(), Ordering::SeqCst);
    }

    pub fn clear_pid(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }

    pub fn pid_dir(&self) -> &Path {
        &self.pid_dir
    }

    pub(crate) fn attach_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

pub type TransitionFn = fn(&StateRecord, State, State) -> anyhow::Result<()>;

fn to_unmonitored(record: &StateRecord, _from: State, _to: State) -> anyhow::Result<()> {
    let watch = &record.watch;
    let mut pid = record.pid();

    // No PID yet, which is the usual case on startup: try the PID file a
    // previous run may have left behind.
    if pid.as_raw() < 1 {
        pid = process::read_pid(&watch.name, record.pid_dir()).unwrap_or_else(|| Pid::from_raw(0));
    }

    let mut running = false;
    if pid.as_raw() > 0 {
        running = process::is_running(pid);
        if running {
            record.set_pid(pid);
        } else {
            record.clear_pid();
        }
    }

    record.set_state(if running {
        State::Running
    } else {
        State::Stopped
    });
    Ok(())
}

fn start(record: &StateRecord, _from: State, _to: State) -> anyhow::Result<()> {
    let pid = process::spawn(&record.watch)?;
    record.set_pid(pid);
    if let Err(err) = process::write_pid(&record.watch.name, pid, record.pid_dir()) {
        warn!(watch = %record.watch.name, "failed to record PID file: {err:#}");
    }
    Ok(())
}

fn running(_record: &StateRecord, _from: State, _to: State) -> anyhow::Result<()> {
    Ok(())
}

fn stop(_record: &StateRecord, _from: State, _to: State) -> anyhow::Result<()> {
    Ok(())
}

fn stopped(record: &StateRecord, _from: State, _to: State) -> anyhow::Result<()> {
    // Whenever a watch is observed stopped, a restart is scheduled.
    record.set_state(State::Starting);
    Ok(())
}

const NONE: Option<TransitionFn> = None;

/// Legal transitions, indexed `[from][to]` in declaration order of
/// [`State`]. Absent entries are disallowed; QUIT never reaches the table.
static TRANSITIONS: [[Option<TransitionFn>; STATE_COUNT]; STATE_COUNT] = [
    // from Init
    [NONE, Some(to_unmonitored), NONE, NONE, NONE, NONE, NONE],
    // from Unmonitored
    [NONE, NONE, Some(start), Some(running), Some(stop), Some(stopped), NONE],
    // from Starting
    [NONE, Some(to_unmonitored), NONE, Some(running), Some(stop), Some(stopped), NONE],
    // from Running
    [NONE, Some(to_unmonitored), NONE, NONE, Some(stop), Some(stopped), NONE],
    // from Stopping
    [NONE, Some(to_unmonitored), NONE, NONE, NONE, Some(stopped), NONE],
    // from Stopped
    [NONE, Some(to_unmonitored), Some(start), NONE, NONE, NONE, NONE],
    // from Quit
    [NONE, NONE, NONE, NONE, NONE, NONE, NONE],
];

pub fn transition_action(from: State, to: State) -> Option<TransitionFn> {
    TRANSITIONS[from.index()][to.index()]
}

/// Worker loop: one per watch, serializes that watch's transitions.
///
/// Blocks on the record's wake; each permit means "the state may have been
/// updated". QUIT terminates the loop before any table lookup. A failed
/// action restores the previous state; a disallowed transition is consumed
/// without running anything.
pub fn state_loop(record: &StateRecord) {
    let watch = &record.watch;
    let mut last_state = State::Init;

    debug!(watch = %watch.name, "starting state loop");

    loop {
        record.wake.wait();
        let current = record.state();

        if current == State::Quit {
            info!(watch = %watch.name, "watch terminating");
            break;
        }

        if current == last_state {
            debug!(watch = %watch.name, pid = record.pid().as_raw(), "state stayed {last_state}");
            continue;
        }

        match transition_action(last_state, current) {
            None => {
                debug!(watch = %watch.name, "transition from {last_state} to {current} is not valid");
                last_state = current;
            }
            Some(action) => {
                debug!(watch = %watch.name, pid = record.pid().as_raw(), "{last_state} -> {current}");
                match action(record, last_state, current) {
                    Ok(()) => last_state = current,
                    Err(err) => {
                        record.restore_state(last_state);
                        warn!(
                            watch = %watch.name,
                            pid = record.pid().as_raw(),
                            "transition to {current} failed, staying {last_state}: {err:#}"
                        );
                    }
                }
            }
        }
    }
}

/// Route a process-connector event to the watch owning the PID.
///
/// EXIT of a known child records STOPPED; a FORK whose parent is a known
/// child confirms the child RUNNING. Writes are skipped when the state
/// already matches, so event storms do not produce redundant wakes.
pub fn dispatch_event(pid: Pid, event: &ProcessEvent, supervisor: &Supervisor) {
    debug!(pid = pid.as_raw(), "incoming event data");

    for record in supervisor.states() {
        if record.pid() != pid {
            continue;
        }
        let next = match event {
            ProcessEvent::Exit { .. } => State::Stopped,
            ProcessEvent::Fork { .. } => State::Running,
        };
        if next != record.state() {
            record.set_state(next);
        }
    }
}

/// Route a liveness-poll result to the watch owning the PID.
pub fn dispatch_poll_result(pid: Pid, running: bool, supervisor: &Supervisor) {
    debug!(pid = pid.as_raw(), running, "incoming polling data");

    for record in supervisor.states() {
        if record.pid() != pid {
            continue;
        }
        let next = if running {
            State::Running
        } else {
            State::Stopped
        };
        if next != record.state() {
            record.set_state(next);
        }
    }
}
