use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{
    chdir, execvp, fork, initgroups, setgid, setgroups, setsid, setuid, ForkResult, Gid, Pid, Uid,
};
use tracing::error;

use crate::watch::Watch;

const DEV_NULL: &std::ffi::CStr = c"/dev/null";

/// Fork and exec a watch's command line, returning the child PID.
///
/// Everything the child needs (argv, the user name for supplementary
/// groups) is prepared before forking; the child side only makes raw calls.
/// A missing executable makes the child exit 0 so the supervisor observes a
/// plain exit and re-derives the state. A failed `fork` is fatal to the
/// whole supervisor.
pub fn spawn(watch: &Watch) -> anyhow::Result<Pid> {
    let argv: Vec<CString> = watch
        .start
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .with_context(|| format!("watch '{}': start command contains a NUL byte", watch.name))?;
    let executable = argv[0].clone();

    let uid = watch.uid.map(Uid::from_raw);
    let gid = watch.gid.map(Gid::from_raw);
    let user = match watch.user.as_deref() {
        Some(name) => Some(
            CString::new(name)
                .with_context(|| format!("watch '{}': user name contains a NUL byte", watch.name))?,
        ),
        None => None,
    };
    let workdir: &Path = match &watch.dir {
        Some(dir) if dir.is_dir() => dir,
        _ => Path::new("/"),
    };

    match unsafe { fork() } {
        Err(err) => {
            error!("fork failed: {err}");
            std::process::exit(1);
        }
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => {
            umask(Mode::empty());
            let _ = setsid();

            if let Some(gid) = gid {
                let _ = setgroups(&[gid]);
                let _ = setgid(gid);
            }
            if let (Some(user), Some(gid), Some(_)) = (user.as_deref(), gid, uid) {
                let _ = initgroups(user, gid);
            }
            if let Some(uid) = uid {
                let _ = setuid(uid);
            }

            let _ = chdir(workdir);

            // The three lowest free descriptors are 0, 1 and 2, so the
            // reopen order pins the standard streams to the null device.
            unsafe {
                libc::close(libc::STDIN_FILENO);
                libc::close(libc::STDOUT_FILENO);
                libc::close(libc::STDERR_FILENO);
                libc::open(DEV_NULL.as_ptr(), libc::O_RDONLY);
                libc::open(DEV_NULL.as_ptr(), libc::O_WRONLY);
                libc::open(DEV_NULL.as_ptr(), libc::O_RDWR);
            }

            match execvp(&executable, &argv) {
                // Missing command: exit clean, the parent re-derives state.
                Err(Errno::ENOENT) => unsafe { libc::_exit(0) },
                // stderr already points at /dev/null; the nonzero exit
                // code is all the parent can observe.
                Err(_) => unsafe { libc::_exit(1) },
                Ok(infallible) => match infallible {},
            }
        }
    }
}

fn pid_file(name: &str, pid_dir: &Path) -> PathBuf {
    pid_dir.join(format!("{name}.pid"))
}

/// Record the most recent child PID for a watch.
pub fn write_pid(name: &str, pid: Pid, pid_dir: &Path) -> anyhow::Result<()> {
    let path = pid_file(name, pid_dir);
    fs::write(&path, format!("{pid}\n"))
        .with_context(|| format!("write PID file {}", path.display()))
}

/// Read a previously recorded PID. An absent or unparsable file means "no
/// prior PID".
pub fn read_pid(name: &str, pid_dir: &Path) -> Option<Pid> {
    let raw = fs::read_to_string(pid_file(name, pid_dir)).ok()?;
    let pid = raw.trim().parse::<i32>().ok()?;
    (pid > 0).then(|| Pid::from_raw(pid))
}

/// Probe whether `pid` is alive (signal 0). EPERM counts as alive: the
/// process exists, it just belongs to somebody else.
pub fn is_running(pid: Pid) -> bool {
    pid.as_raw() > 0 && matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}
