//! warden — a process supervisor for UNIX-like hosts.
//!
//! For each configured watch, warden spawns the program, observes its
//! lifetime through the kernel process connector (falling back to liveness
//! polling where netlink is unavailable), and drives a per-watch state
//! machine so the program's runtime status follows the operator's intent.
//!
//! One ingestion loop on the main thread feeds `(pid, event)` pairs into a
//! dispatch layer; one worker thread per watch consumes state updates
//! through a counting wake and executes transition actions from a static
//! table. Children are reaped by a SIGCHLD handler; SIGTERM/SIGINT request
//! an orderly shutdown.

pub mod cli;
pub mod config;
pub mod event;
pub mod poll;
pub mod process;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod wake;
pub mod watch;

pub use config::{load_config, Config};
pub use state::{State, StateRecord};
pub use supervisor::{ShutdownHandle, Supervisor};
pub use watch::Watch;
