use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::signals;
use crate::supervisor::Supervisor;

// Netlink connector identifiers for the process-event multicast group and
// the subscription opcodes carried in the control frame.
const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

// Frame layout: netlink header, connector header, then the proc_event.
// The connector payload is packed directly behind the header, so the
// proc_event is not 8-aligned within the datagram and fields are decoded
// by offset instead of through a struct overlay.
const NLMSG_HDR_LEN: usize = mem::size_of::<libc::nlmsghdr>();
const CN_MSG_LEN: usize = 20;
const EVENT_OFFSET: usize = NLMSG_HDR_LEN + CN_MSG_LEN;
// proc_event: what(4) cpu(4) timestamp(8), then the per-type payload.
const EVENT_DATA_OFFSET: usize = EVENT_OFFSET + 16;

const MCAST_MSG_LEN: usize = EVENT_OFFSET + 4;
const RECV_BUF_LEN: usize = 256;
const MAX_EVENTS: usize = 16;

/// Decoded process-connector event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Fork {
        parent_pid: i32,
        parent_tgid: i32,
        child_pid: i32,
        child_tgid: i32,
    },
    Exit {
        pid: i32,
        tgid: i32,
        exit_code: u32,
        exit_signal: u32,
    },
}

impl ProcessEvent {
    /// PID whose watch the event concerns: the parent for forks, the
    /// exiting process otherwise.
    pub fn affected_pid(&self) -> Pid {
        match self {
            ProcessEvent::Fork { parent_pid, .. } => Pid::from_raw(*parent_pid),
            ProcessEvent::Exit { pid, .. } => Pid::from_raw(*pid),
        }
    }
}

pub type ProcessHandler = fn(Pid, &ProcessEvent, &Supervisor);

/// Open the netlink connector socket and join the process-event group.
pub fn netlink_connect(self_pid: Pid) -> anyhow::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::PF_NETLINK, libc::SOCK_DGRAM, libc::NETLINK_CONNECTOR) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("open netlink socket");
    }
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = CN_IDX_PROC;
    addr.nl_pid = self_pid.as_raw() as u32;

    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("bind netlink socket");
    }

    Ok(socket)
}

/// Build the LISTEN/IGNORE control frame: netlink header, connector header,
/// one `proc_cn_mcast_op` word.
fn mcast_message(op: u32, self_pid: Pid) -> [u8; MCAST_MSG_LEN] {
    let mut msg = [0u8; MCAST_MSG_LEN];
    put_u32(&mut msg, 0, MCAST_MSG_LEN as u32); // nlmsg_len
    put_u16(&mut msg, 4, libc::NLMSG_DONE as u16); // nlmsg_type
    put_u32(&mut msg, 12, self_pid.as_raw() as u32); // nlmsg_pid
    put_u32(&mut msg, NLMSG_HDR_LEN, CN_IDX_PROC); // cb_id.idx
    put_u32(&mut msg, NLMSG_HDR_LEN + 4, CN_VAL_PROC); // cb_id.val
    put_u16(&mut msg, NLMSG_HDR_LEN + 16, 4); // payload length
    put_u32(&mut msg, EVENT_OFFSET, op);
    msg
}

fn set_event_listen(socket: &OwnedFd, self_pid: Pid, enable: bool) -> anyhow::Result<()> {
    let op = if enable {
        PROC_CN_MCAST_LISTEN
    } else {
        PROC_CN_MCAST_IGNORE
    };
    let msg = mcast_message(op, self_pid);
    let rc = unsafe { libc::send(socket.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).with_context(|| {
            format!(
                "send {} control message",
                if enable { "LISTEN" } else { "IGNORE" }
            )
        });
    }
    Ok(())
}

/// Decode one received datagram. Event types the supervisor does not care
/// about (exec, uid changes, ...) decode to `None`.
pub fn parse_event(buf: &[u8]) -> Option<ProcessEvent> {
    if buf.len() < EVENT_DATA_OFFSET + 16 {
        return None;
    }

    let data = EVENT_DATA_OFFSET;
    match read_u32(buf, EVENT_OFFSET) {
        PROC_EVENT_FORK => Some(ProcessEvent::Fork {
            parent_pid: read_i32(buf, data),
            parent_tgid: read_i32(buf, data + 4),
            child_pid: read_i32(buf, data + 8),
            child_tgid: read_i32(buf, data + 12),
        }),
        PROC_EVENT_EXIT => Some(ProcessEvent::Exit {
            pid: read_i32(buf, data),
            tgid: read_i32(buf, data + 4),
            exit_code: read_u32(buf, data + 8),
            exit_signal: read_u32(buf, data + 12),
        }),
        _ => None,
    }
}

/// Run the ingestion loop on the given connector socket until shutdown is
/// requested or the socket dies. Subscribes on entry and unsubscribes on
/// the way out; the caller has already installed signal handlers.
pub fn event_loop(
    socket: OwnedFd,
    supervisor: &Supervisor,
    handler: ProcessHandler,
) -> anyhow::Result<()> {
    set_event_listen(&socket, supervisor.self_pid(), true)?;

    let result = handle_process_events(&socket, supervisor, handler);

    if let Err(err) = set_event_listen(&socket, supervisor.self_pid(), false) {
        warn!("failed to unsubscribe from process events: {err:#}");
    }
    result
}

fn handle_process_events(
    socket: &OwnedFd,
    supervisor: &Supervisor,
    handler: ProcessHandler,
) -> anyhow::Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("create epoll instance")?;

    set_nonblocking(socket.as_raw_fd())?;
    epoll
        .add(
            socket,
            EpollEvent::new(EpollFlags::EPOLLIN, socket.as_raw_fd() as u64),
        )
        .context("register netlink socket")?;

    let wake = supervisor.shutdown_descriptor();
    set_nonblocking(wake.as_raw_fd())?;
    epoll
        .add(
            wake,
            EpollEvent::new(EpollFlags::EPOLLIN, wake.as_raw_fd() as u64),
        )
        .context("register shutdown descriptor")?;

    let mut ready = vec![EpollEvent::empty(); MAX_EVENTS];
    let mut buf = [0u8; RECV_BUF_LEN];

    info!("starting event manager loop");

    while !signals::shutdown_requested() {
        let count = match epoll.wait(&mut ready, EpollTimeout::NONE) {
            Ok(count) => count,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("wait for readiness"),
        };

        for event in &ready[..count] {
            if event.data() == wake.as_raw_fd() as u64 {
                debug!("received shutdown wake");
                drain_shutdown_wake(wake.as_raw_fd());
                signals::request_shutdown();
                continue;
            }

            let received =
                unsafe { libc::recv(socket.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
            if received == 0 {
                // Subscription side closed by the peer.
                return Ok(());
            }
            if received < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                    _ => return Err(err).context("recv process event"),
                }
            }

            let Some(proc_event) = parse_event(&buf[..received as usize]) else {
                continue;
            };
            log_event(&proc_event);

            let pid = proc_event.affected_pid();
            if pid.as_raw() > 0 {
                handler(pid, &proc_event, supervisor);
            }
        }
    }

    Ok(())
}

/// Consume one 8-byte value from the shutdown descriptor. Read errors are
/// logged; shutdown proceeds regardless.
pub(crate) fn drain_shutdown_wake(fd: RawFd) {
    let mut value = [0u8; 8];
    let rc = unsafe { libc::read(fd, value.as_mut_ptr().cast(), value.len()) };
    if rc < 0 {
        warn!(
            "failed to drain shutdown descriptor: {}",
            io::Error::last_os_error()
        );
    }
}

fn log_event(event: &ProcessEvent) {
    match event {
        ProcessEvent::Fork {
            parent_pid,
            parent_tgid,
            child_pid,
            child_tgid,
        } => debug!("fork: parent tid={parent_pid} pid={parent_tgid} -> child tid={child_pid} pid={child_tgid}"),
        ProcessEvent::Exit {
            pid,
            tgid,
            exit_code,
            ..
        } => debug!("exit: tid={pid} pid={tgid} exit_code={exit_code}"),
    }
}

fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("read descriptor flags");
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error()).context("set descriptor non-blocking");
    }
    Ok(())
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_ne_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_ne_bytes(bytes)
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    i32::from_ne_bytes(bytes)
}
