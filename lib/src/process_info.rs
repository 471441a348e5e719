//! Process metadata read from `/proc`: ids, signal state, sessions, single descriptors and
//! threads.

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::MetadataExt;

use crate::error::{Result, TraceError};

/// Fields of `/proc/<pid>/status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcStatus {
    pub name: String,
    pub state: String,
    pub tgid: i32,
    pub pid: i32,
    pub ppid: i32,
    /// Real, effective, saved and filesystem uid
    pub uid: [u32; 4],
    pub gid: [u32; 4],
    pub sig_pending: u64,
    pub shared_pending: u64,
    pub sig_blocked: u64,
    pub sig_ignored: u64,
    pub sig_caught: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Default,
    Ignore,
    Handler,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalAction {
    pub signal: String,
    pub number: i32,
    pub disposition: Disposition,
    pub blocked: bool,
    pub pending: bool,
}

/// Signal masks of a thread plus the disposition of every standard signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalInfo {
    pub blocked: u64,
    pub pending: u64,
    pub shared_pending: u64,
    pub ignored: u64,
    pub caught: u64,
    pub actions: Vec<SignalAction>,
}

impl SignalInfo {
    pub fn from_status(status: &ProcStatus) -> Self {
        let pending = status.sig_pending | status.shared_pending;
        let actions = Signal::iterator()
            .map(|sig| {
                let bit = sig_bit(sig);
                let disposition = if status.sig_caught & bit != 0 {
                    Disposition::Handler
                } else if status.sig_ignored & bit != 0 {
                    Disposition::Ignore
                } else {
                    Disposition::Default
                };
                SignalAction {
                    signal: sig.as_str().to_string(),
                    number: sig as i32,
                    disposition,
                    blocked: status.sig_blocked & bit != 0,
                    pending: pending & bit != 0,
                }
            })
            .collect();
        Self {
            blocked: status.sig_blocked,
            pending: status.sig_pending,
            shared_pending: status.shared_pending,
            ignored: status.sig_ignored,
            caught: status.sig_caught,
            actions,
        }
    }

    pub fn action(&self, sig: Signal) -> Option<&SignalAction> {
        self.actions.iter().find(|a| a.number == sig as i32)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: i32,
    pub pgid: i32,
    /// Process group owning the controlling terminal, -1 without one
    pub foreground_pgid: i32,
    /// Other process groups of the same session
    pub other_pgids: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PidInfo {
    pub pid: i32,
    pub tgid: i32,
    pub ppid: i32,
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub session: SessionInfo,
}

/// One open file descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FdInfo {
    pub fd: i32,
    pub target: String,
    /// `st_mode` of the open file, 0 if it cannot be stat'ed
    pub mode: u32,
    pub nlinks: u64,
    /// Open flags (`O_*`)
    pub flags: u32,
    pub pos: u64,
    pub readable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub tid: i32,
    pub name: String,
    pub state: char,
}

/// The fields of `/proc/<pid>/stat` following the command name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    state: char,
    ppid: i32,
    pgrp: i32,
    session: i32,
    tpgid: i32,
}

fn sig_bit(sig: Signal) -> u64 {
    1u64 << (sig as i32 - 1)
}

fn proc_file(pid: Pid, entry: &str) -> Result<String> {
    fs::read_to_string(format!("/proc/{}/{}", pid, entry)).map_err(|e| match e.raw_os_error() {
        Some(libc::ESRCH) => TraceError::ProcessGone(pid),
        _ => TraceError::Io(e),
    })
}

fn bad_format(entry: &str, line: &str) -> TraceError {
    TraceError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unexpected {} line {:?}", entry, line),
    ))
}

fn parse_ids(entry: &str, line: &str, value: &str) -> Result<[u32; 4]> {
    let mut ids = [0u32; 4];
    let mut fields = value.split_whitespace();
    for id in ids.iter_mut() {
        *id = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| bad_format(entry, line))?;
    }
    Ok(ids)
}

fn parse_status(text: &str) -> Result<ProcStatus> {
    let mut status = ProcStatus::default();
    for line in text.lines() {
        let (key, value) = match line.split_once(':') {
            Some((k, v)) => (k, v.trim()),
            None => continue,
        };
        let int = || value.parse::<i32>().map_err(|_| bad_format("status", line));
        let mask = || u64::from_str_radix(value, 16).map_err(|_| bad_format("status", line));
        match key {
            "Name" => status.name = value.to_string(),
            "State" => status.state = value.to_string(),
            "Tgid" => status.tgid = int()?,
            "Pid" => status.pid = int()?,
            "PPid" => status.ppid = int()?,
            "Uid" => status.uid = parse_ids("status", line, value)?,
            "Gid" => status.gid = parse_ids("status", line, value)?,
            "SigPnd" => status.sig_pending = mask()?,
            "ShdPnd" => status.shared_pending = mask()?,
            "SigBlk" => status.sig_blocked = mask()?,
            "SigIgn" => status.sig_ignored = mask()?,
            "SigCgt" => status.sig_caught = mask()?,
            _ => (),
        }
    }
    Ok(status)
}

fn parse_stat(text: &str) -> Result<StatFields> {
    // The command name may itself contain spaces and parentheses
    let rest = text
        .rfind(')')
        .map(|i| &text[i + 1..])
        .ok_or_else(|| bad_format("stat", text))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 6 {
        return Err(bad_format("stat", text));
    }
    let int = |i: usize| fields[i].parse::<i32>().map_err(|_| bad_format("stat", text));
    Ok(StatFields {
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: int(1)?,
        pgrp: int(2)?,
        session: int(3)?,
        tpgid: int(5)?,
    })
}

fn stat_comm(text: &str) -> String {
    match (text.find('('), text.rfind(')')) {
        (Some(start), Some(end)) if start < end => text[start + 1..end].to_string(),
        _ => String::new(),
    }
}

/// Returns `(pos, flags)` from the contents of `/proc/<pid>/fdinfo/<fd>`
fn parse_fdinfo(text: &str) -> Result<(u64, u32)> {
    let mut pos = 0;
    let mut flags = 0;
    for line in text.lines() {
        match line.split_once(':') {
            Some(("pos", v)) => pos = v.trim().parse().map_err(|_| bad_format("fdinfo", line))?,
            Some(("flags", v)) => {
                flags = u32::from_str_radix(v.trim(), 8).map_err(|_| bad_format("fdinfo", line))?
            }
            _ => (),
        }
    }
    Ok((pos, flags))
}

pub fn read_status(pid: Pid) -> Result<ProcStatus> {
    parse_status(&proc_file(pid, "status")?)
}

pub fn read_pid_info(pid: Pid, status: &ProcStatus) -> Result<PidInfo> {
    let stat = parse_stat(&proc_file(pid, "stat")?)?;
    Ok(PidInfo {
        pid: status.pid,
        tgid: status.tgid,
        ppid: stat.ppid,
        uid: status.uid[0],
        gid: status.gid[0],
        euid: status.uid[1],
        egid: status.gid[1],
        session: SessionInfo {
            session_id: stat.session,
            pgid: stat.pgrp,
            foreground_pgid: stat.tpgid,
            other_pgids: session_pgids(stat.session, stat.pgrp),
        },
    })
}

/// Process groups of `session` other than `own`, found by scanning `/proc`
fn session_pgids(session: i32, own: i32) -> Vec<i32> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut pgids = BTreeSet::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_str().map_or(false, |n| n.bytes().all(|b| b.is_ascii_digit())) {
            continue;
        }
        // Processes come and go while scanning
        let stat = match fs::read_to_string(entry.path().join("stat")).ok().and_then(|t| parse_stat(&t).ok()) {
            Some(stat) => stat,
            None => continue,
        };
        if stat.session == session && stat.pgrp != own {
            pgids.insert(stat.pgrp);
        }
    }
    pgids.into_iter().collect()
}

pub fn read_fd_info(pid: Pid, fd: i32) -> Result<FdInfo> {
    let link = format!("/proc/{}/fd/{}", pid, fd);
    let target = fs::read_link(&link)?.to_string_lossy().into_owned();
    let (pos, flags) = parse_fdinfo(&proc_file(pid, &format!("fdinfo/{}", fd))?)?;
    let (mode, nlinks) = fs::metadata(&link).map_or((0, 0), |m| (m.mode(), m.nlink()));
    let access = flags as i32 & libc::O_ACCMODE;
    Ok(FdInfo {
        fd,
        target,
        mode,
        nlinks,
        flags,
        pos,
        readable: access == libc::O_RDONLY || access == libc::O_RDWR,
        writable: access == libc::O_WRONLY || access == libc::O_RDWR,
    })
}

/// Threads of the thread group `pid` belongs to, by tid
pub fn read_threads(pid: Pid) -> Result<Vec<ThreadInfo>> {
    let mut threads = Vec::new();
    for entry in fs::read_dir(format!("/proc/{}/task", pid))? {
        let entry = entry?;
        let tid = match entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            Some(tid) => tid,
            None => continue,
        };
        let text = match fs::read_to_string(entry.path().join("stat")) {
            Ok(text) => text,
            Err(_) => continue,
        };
        threads.push(ThreadInfo {
            tid,
            name: stat_comm(&text),
            state: parse_stat(&text)?.state,
        });
    }
    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Accepts `"SIGINT"` as well as `"INT"`
pub fn signal_by_name(name: &str) -> Result<Signal> {
    let full = if name.starts_with("SIG") {
        name.to_string()
    } else {
        format!("SIG{}", name)
    };
    full.parse::<Signal>()
        .map_err(|_| TraceError::Handler(format!("unknown signal {:?}", name)))
}
