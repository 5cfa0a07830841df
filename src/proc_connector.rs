//! Linux process events via the netlink connector
//!
//! Subscribes to `CN_IDX_PROC` multicast on a `NETLINK_CONNECTOR` socket,
//! which needs root. Kernel notifications map onto start/stop as follows:
//!
//! - fork of a new thread-group leader → `Started`
//! - exec → `Stopped` then `Started` for the same pid (new image, new span)
//! - exit of a thread-group leader → `Stopped`
//!
//! Thread creation and exit are ignored. Payloads are cached per pid at start
//! so stop events still carry the command line after /proc is gone.

use crate::error::{Result, TraceError};
use crate::event::{EventData, ProcessEvent};
use crate::procfs::ProcSnapshot;
use crate::source::{EventSession, EventSource, STOP_POLL_INTERVAL};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{bind, recv, send, setsockopt, sockopt, MsgFlags, NetlinkAddr};
use nix::time::{clock_gettime, ClockId};
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;

const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;

const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const NLMSG_HDR_LEN: usize = 16;
const CN_MSG_LEN: usize = 20;
/// what, cpu, timestamp_ns
const PROC_EVENT_HDR_LEN: usize = 16;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Kernel process-events connector
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcConnector;

impl ProcConnector {
    pub fn new() -> Self {
        Self
    }
}

impl EventSource for ProcConnector {
    fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn open(&self, session_name: &str) -> Result<Box<dyn EventSession>> {
        Ok(Box::new(ConnectorSession::open(session_name)?))
    }
}

/// Decoded `struct proc_event` payloads we act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KernelEvent {
    Fork {
        parent_tgid: i32,
        child_pid: i32,
        child_tgid: i32,
        timestamp_ns: u64,
    },
    Exec {
        pid: i32,
        tgid: i32,
        timestamp_ns: u64,
    },
    Exit {
        pid: i32,
        tgid: i32,
        exit_code: u32,
        timestamp_ns: u64,
    },
}

/// What we remember about a process announced as started
#[derive(Debug, Clone)]
struct Known {
    name: String,
    parent: i32,
    payload: Vec<(String, String)>,
}

struct ConnectorSession {
    socket: OwnedFd,
    session_name: String,
    opened_ns: u64,
    known: HashMap<i32, Known>,
}

impl ConnectorSession {
    fn open(session_name: &str) -> Result<Self> {
        let socket = connector_socket().map_err(|e| subsystem("netlink socket", e))?;

        if let Err(e) = setsockopt(&socket, sockopt::RcvBuf, &RECV_BUFFER_BYTES) {
            tracing::debug!("could not enlarge netlink receive buffer: {}", e);
        }

        bind(socket.as_raw_fd(), &NetlinkAddr::new(0, CN_IDX_PROC))
            .map_err(|e| subsystem("netlink bind", e))?;

        send_control(&socket, PROC_CN_MCAST_LISTEN)
            .map_err(|e| subsystem("subscribe to process events", e))?;

        let now = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map_err(|e| TraceError::Subsystem(format!("monotonic clock: {}", e)))?;
        let opened_ns = now.tv_sec() as u64 * 1_000_000_000 + now.tv_nsec() as u64;

        tracing::info!(session = session_name, "process event session opened");

        Ok(Self {
            socket,
            session_name: session_name.to_string(),
            opened_ns,
            known: HashMap::new(),
        })
    }

    fn relative_ms(&self, timestamp_ns: u64) -> f64 {
        timestamp_ns.saturating_sub(self.opened_ns) as f64 / 1_000_000.0
    }

    fn dispatch(&mut self, event: KernelEvent, sink: &mut dyn FnMut(ProcessEvent)) {
        match event {
            KernelEvent::Fork {
                parent_tgid,
                child_pid,
                child_tgid,
                timestamp_ns,
            } if child_pid == child_tgid => {
                let ts = self.relative_ms(timestamp_ns);
                let known = self.describe(child_pid, parent_tgid);
                sink(ProcessEvent::Started(started_data(child_pid, ts, &known)));
                self.known.insert(child_pid, known);
            }
            KernelEvent::Exec {
                pid,
                tgid,
                timestamp_ns,
            } if pid == tgid => {
                let ts = self.relative_ms(timestamp_ns);
                let parent = match self.known.remove(&pid) {
                    Some(previous) => {
                        sink(ProcessEvent::Stopped(EventData {
                            pid,
                            name: previous.name,
                            timestamp_ms: ts,
                            payload: previous.payload,
                        }));
                        Some(previous.parent)
                    }
                    None => None,
                };

                let parent = parent
                    .or_else(|| ProcSnapshot::read(pid).ok().map(|s| s.ppid))
                    .unwrap_or(crate::record::NONE);
                let known = self.describe(pid, parent);
                sink(ProcessEvent::Started(started_data(pid, ts, &known)));
                self.known.insert(pid, known);
            }
            KernelEvent::Exit {
                pid,
                tgid,
                exit_code,
                timestamp_ns,
            } if pid == tgid => {
                let ts = self.relative_ms(timestamp_ns);
                let (name, mut payload) = match self.known.remove(&pid) {
                    Some(known) => (known.name, known.payload),
                    None => (
                        String::new(),
                        vec![("ProcessID".to_string(), pid.to_string())],
                    ),
                };
                payload.push(("ExitStatus".to_string(), exit_status(exit_code).to_string()));
                sink(ProcessEvent::Stopped(EventData {
                    pid,
                    name,
                    timestamp_ms: ts,
                    payload,
                }));
            }
            _ => {}
        }
    }

    /// Snapshot a process; falls back to pid-only details if it already left
    fn describe(&self, pid: i32, parent: i32) -> Known {
        match ProcSnapshot::read(pid) {
            Ok(snapshot) => Known {
                name: snapshot.name.clone(),
                parent,
                payload: snapshot.payload(parent),
            },
            Err(e) => {
                tracing::debug!(pid, "process vanished before it could be read: {}", e);
                let name = self
                    .known
                    .get(&parent)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                Known {
                    name,
                    parent,
                    payload: vec![
                        ("ProcessID".to_string(), pid.to_string()),
                        ("ParentID".to_string(), parent.to_string()),
                    ],
                }
            }
        }
    }
}

impl EventSession for ConnectorSession {
    fn pump(&mut self, stop: &AtomicBool, sink: &mut dyn FnMut(ProcessEvent)) -> Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        let timeout = PollTimeout::try_from(STOP_POLL_INTERVAL)
            .map_err(|e| TraceError::Subsystem(format!("poll timeout: {}", e)))?;

        while !stop.load(Ordering::Acquire) {
            let mut fds = [PollFd::new(self.socket.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(e) => return Err(TraceError::Subsystem(format!("poll: {}", e))),
            }

            let n = match recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => {
                    return Err(TraceError::Subsystem("netlink socket closed".to_string()));
                }
                Ok(n) => n,
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(Errno::ENOBUFS) => {
                    return Err(TraceError::Subsystem(
                        "kernel event buffer overflow; process events were lost".to_string(),
                    ))
                }
                Err(e) => return Err(subsystem("netlink recv", e)),
            };

            for event in parse_datagram(&buf[..n]) {
                self.dispatch(event, sink);
            }
        }

        tracing::info!(session = %self.session_name, "process event session stopping");
        Ok(())
    }
}

impl Drop for ConnectorSession {
    fn drop(&mut self) {
        if let Err(e) = send_control(&self.socket, PROC_CN_MCAST_IGNORE) {
            tracing::debug!("failed to unsubscribe from process events: {}", e);
        }
    }
}

fn started_data(pid: i32, timestamp_ms: f64, known: &Known) -> EventData {
    EventData {
        pid,
        name: known.name.clone(),
        timestamp_ms,
        payload: known.payload.clone(),
    }
}

fn subsystem(what: &str, err: Errno) -> TraceError {
    match err {
        Errno::EPERM | Errno::EACCES => TraceError::Permission(format!("{}: {}", what, err)),
        _ => TraceError::Subsystem(format!("{}: {}", what, err)),
    }
}

/// Exit code of a wait status, or 128 + signal for a killed process
fn exit_status(code: u32) -> i32 {
    let signal = code & 0x7f;
    if signal == 0 {
        ((code >> 8) & 0xff) as i32
    } else {
        128 + signal as i32
    }
}

/// `socket(AF_NETLINK, SOCK_DGRAM, NETLINK_CONNECTOR)`
///
/// nix has no `SockProtocol` for the connector family, so this one call goes
/// through libc directly.
fn connector_socket() -> std::result::Result<OwnedFd, Errno> {
    // SAFETY: plain socket(2) with constant arguments
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::NETLINK_CONNECTOR,
        )
    };
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: fd is a freshly created descriptor nothing else owns
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Send a `proc_cn_mcast_op` to the connector
fn send_control(socket: &OwnedFd, op: u32) -> std::result::Result<(), Errno> {
    send(socket.as_raw_fd(), &control_message(op), MsgFlags::empty()).map(|_| ())
}

/// nlmsghdr + cn_msg + u32 op
fn control_message(op: u32) -> Vec<u8> {
    let total = NLMSG_HDR_LEN + CN_MSG_LEN + 4;
    let mut msg = Vec::with_capacity(total);

    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&NLMSG_DONE.to_ne_bytes());
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // port id

    msg.extend_from_slice(&CN_IDX_PROC.to_ne_bytes());
    msg.extend_from_slice(&CN_VAL_PROC.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // ack
    msg.extend_from_slice(&4u16.to_ne_bytes()); // len
    msg.extend_from_slice(&0u16.to_ne_bytes()); // flags

    msg.extend_from_slice(&op.to_ne_bytes());
    msg
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_ne_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    Some(i32::from_ne_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_ne_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// Split one datagram into netlink messages and decode the process events
fn parse_datagram(buf: &[u8]) -> Vec<KernelEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while let Some(len) = read_u32(buf, offset) {
        let len = len as usize;
        if len < NLMSG_HDR_LEN || offset + len > buf.len() {
            break;
        }
        let msg_type = read_u16(buf, offset + 4).unwrap_or(NLMSG_NOOP);
        if msg_type != NLMSG_NOOP && msg_type != NLMSG_ERROR {
            if let Some(event) = parse_connector(&buf[offset + NLMSG_HDR_LEN..offset + len]) {
                events.push(event);
            }
        }
        // NLMSG_ALIGN
        offset += (len + 3) & !3;
    }
    events
}

/// Decode a cn_msg carrying a proc_event
fn parse_connector(msg: &[u8]) -> Option<KernelEvent> {
    if read_u32(msg, 0)? != CN_IDX_PROC || read_u32(msg, 4)? != CN_VAL_PROC {
        return None;
    }
    let event = msg.get(CN_MSG_LEN..)?;
    let what = read_u32(event, 0)?;
    let timestamp_ns = read_u64(event, 8)?;
    let data = event.get(PROC_EVENT_HDR_LEN..)?;

    match what {
        PROC_EVENT_FORK => Some(KernelEvent::Fork {
            parent_tgid: read_i32(data, 4)?,
            child_pid: read_i32(data, 8)?,
            child_tgid: read_i32(data, 12)?,
            timestamp_ns,
        }),
        PROC_EVENT_EXEC => Some(KernelEvent::Exec {
            pid: read_i32(data, 0)?,
            tgid: read_i32(data, 4)?,
            timestamp_ns,
        }),
        PROC_EVENT_EXIT => Some(KernelEvent::Exit {
            pid: read_i32(data, 0)?,
            tgid: read_i32(data, 4)?,
            exit_code: read_u32(data, 8)?,
            timestamp_ns,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a datagram holding one proc_event
    fn datagram(what: u32, timestamp_ns: u64, fields: &[u32]) -> Vec<u8> {
        let mut event = Vec::new();
        event.extend_from_slice(&what.to_ne_bytes());
        event.extend_from_slice(&0u32.to_ne_bytes()); // cpu
        event.extend_from_slice(&timestamp_ns.to_ne_bytes());
        for field in fields {
            event.extend_from_slice(&field.to_ne_bytes());
        }

        let mut msg = control_message(0);
        msg.truncate(NLMSG_HDR_LEN + CN_MSG_LEN);
        msg.extend_from_slice(&event);
        let len = msg.len() as u32;
        msg[0..4].copy_from_slice(&len.to_ne_bytes());
        msg
    }

    #[test]
    fn test_control_message_layout() {
        let msg = control_message(PROC_CN_MCAST_LISTEN);
        assert_eq!(msg.len(), 40);
        assert_eq!(read_u32(&msg, 0), Some(40));
        assert_eq!(read_u16(&msg, 4), Some(NLMSG_DONE));
        assert_eq!(read_u32(&msg, 16), Some(CN_IDX_PROC));
        assert_eq!(read_u32(&msg, 20), Some(CN_VAL_PROC));
        assert_eq!(read_u16(&msg, 32), Some(4));
        assert_eq!(read_u32(&msg, 36), Some(PROC_CN_MCAST_LISTEN));
    }

    #[test]
    fn test_parse_fork() {
        let buf = datagram(PROC_EVENT_FORK, 5_000, &[10, 10, 11, 11]);
        assert_eq!(
            parse_datagram(&buf),
            vec![KernelEvent::Fork {
                parent_tgid: 10,
                child_pid: 11,
                child_tgid: 11,
                timestamp_ns: 5_000,
            }]
        );
    }

    #[test]
    fn test_parse_exec_and_exit() {
        let mut buf = datagram(PROC_EVENT_EXEC, 1, &[20, 20]);
        buf.extend(datagram(PROC_EVENT_EXIT, 2, &[20, 20, 256, 17]));

        assert_eq!(
            parse_datagram(&buf),
            vec![
                KernelEvent::Exec {
                    pid: 20,
                    tgid: 20,
                    timestamp_ns: 1,
                },
                KernelEvent::Exit {
                    pid: 20,
                    tgid: 20,
                    exit_code: 256,
                    timestamp_ns: 2,
                },
            ]
        );
    }

    #[test]
    fn test_parse_ignores_other_events() {
        // PROC_EVENT_UID
        let buf = datagram(0x4, 1, &[1, 1, 0, 0]);
        assert!(parse_datagram(&buf).is_empty());
    }

    #[test]
    fn test_parse_truncated() {
        let buf = datagram(PROC_EVENT_FORK, 1, &[1, 1, 2, 2]);
        assert!(parse_datagram(&buf[..30]).is_empty());
        assert!(parse_datagram(&[]).is_empty());
    }

    #[test]
    fn test_exit_status_decoding() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(1 << 8), 1);
        assert_eq!(exit_status(42 << 8), 42);
        // SIGKILL
        assert_eq!(exit_status(9), 137);
    }

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(
            subsystem("netlink bind", Errno::EPERM),
            TraceError::Permission(_)
        ));
        assert!(matches!(
            subsystem("netlink socket", Errno::EACCES),
            TraceError::Permission(_)
        ));
        let err = subsystem("netlink recv", Errno::EBADF);
        assert!(matches!(err, TraceError::Subsystem(_)));
        assert!(err.to_string().contains("netlink recv"));
    }

    #[test]
    fn test_elevation_matches_euid() {
        assert_eq!(
            ProcConnector::new().is_elevated(),
            nix::unistd::geteuid().is_root()
        );
    }
}
