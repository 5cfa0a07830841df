//! Process details read from /proc
//!
//! Kernel process events only carry pids; names, command lines and session
//! ids are looked up here while the process still exists.

use std::fs;
use std::io;

/// What /proc/<pid> told us about a process at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSnapshot {
    pub pid: i32,
    pub ppid: i32,
    pub session: i32,
    /// Short name from `comm`
    pub name: String,
    /// Arguments joined by spaces
    pub command_line: String,
    /// Executable path, or the short name when the link is unreadable
    pub image: String,
}

impl ProcSnapshot {
    /// Read /proc/<pid>; fails if the process is already gone
    pub fn read(pid: i32) -> io::Result<Self> {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;
        let fields = StatFields::parse(&stat).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed /proc stat line")
        })?;

        let command_line = fs::read(format!("/proc/{}/cmdline", pid))
            .map(|raw| join_cmdline(&raw))
            .unwrap_or_default();

        let image = fs::read_link(format!("/proc/{}/exe", pid))
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| fields.comm.clone());

        Ok(Self {
            pid,
            ppid: fields.ppid,
            session: fields.session,
            name: fields.comm,
            command_line,
            image,
        })
    }

    /// Event payload fields for this process
    pub fn payload(&self, parent: i32) -> Vec<(String, String)> {
        vec![
            ("ProcessID".to_string(), self.pid.to_string()),
            ("ParentID".to_string(), parent.to_string()),
            ("CommandLine".to_string(), self.command_line.clone()),
            ("ImageFileName".to_string(), self.image.clone()),
            ("SessionID".to_string(), self.session.to_string()),
        ]
    }
}

/// The parts of /proc/<pid>/stat we use
#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    comm: String,
    ppid: i32,
    session: i32,
}

impl StatFields {
    /// `pid (comm) state ppid pgrp session ...`; comm may hold spaces and
    /// parentheses, so split at the last `)`
    fn parse(line: &str) -> Option<Self> {
        let open = line.find('(')?;
        let close = line.rfind(')')?;
        let comm = line.get(open + 1..close)?.to_string();

        let mut rest = line.get(close + 1..)?.split_whitespace();
        let _state = rest.next()?;
        let ppid = rest.next()?.parse().ok()?;
        let _pgrp = rest.next()?;
        let session = rest.next()?.parse().ok()?;

        Some(Self {
            comm,
            ppid,
            session,
        })
    }
}

fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}
