//! Access to a stopped tracee's memory and registers.

use log::debug;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{self, RemoteIoVec};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::cell::{Cell, RefCell};
use std::fs::{self, File, OpenOptions};
use std::io::{self, IoSliceMut};
use std::os::unix::fs::FileExt;

use crate::error::{Result, TraceError};
use crate::process_info::{self, FdInfo, ProcStatus, ThreadInfo};
use crate::process_state::ExitStatus;
use crate::syscalls::SyscallRegs;

/// Upper bound for NUL-terminated reads
pub const MAX_CSTR_LEN: usize = 64 * 1024;

/// Upper bound for one `read_bytes` transfer; syscall counts come from the tracee and may be
/// arbitrarily large
pub const MAX_READ_LEN: usize = 256 * 1024 * 1024;

const PAGE_SIZE: u64 = 4096;

/// A thread stopped under trace
///
/// Implementations must only be used while the thread is in a ptrace-stop; the dispatch loop
/// guarantees this by handing out a `Tracee` only for the duration of one stop.
pub trait Tracee {
    fn pid(&self) -> Pid;

    /// Reads exactly `len` bytes at `addr`
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Writes all of `bytes` at `addr`, returning the number of bytes written
    fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<usize>;

    fn registers(&self) -> Result<SyscallRegs>;

    fn set_registers(&self, regs: &SyscallRegs) -> Result<()>;

    /// Resumes the thread until its next syscall entry or exit stop
    fn step_syscall(&self) -> Result<()>;

    fn argv(&self) -> Result<Vec<String>> {
        read_argv(self.pid())
    }

    fn envs(&self) -> Result<Vec<String>> {
        read_envs(self.pid())
    }

    fn mmaps(&self) -> Result<String> {
        Ok(fs::read_to_string(proc_path(self.pid(), "maps"))?)
    }

    fn fds(&self) -> Result<Vec<(i32, String)>> {
        read_fds(self.pid())
    }

    fn fd_info(&self, fd: i32) -> Result<FdInfo> {
        process_info::read_fd_info(self.pid(), fd)
    }

    fn status(&self) -> Result<ProcStatus> {
        process_info::read_status(self.pid())
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        process_info::read_threads(self.pid())
    }
}

/// `Tracee` backed by ptrace and the tracee's `/proc` entries
///
/// Stepping the thread (for injected syscalls) may consume its exit status or signals meant for
/// it; both are kept here for the control loop to pick up once the stop is handled.
#[derive(Debug)]
pub struct PtraceTracee {
    pid: Pid,
    reaped: Cell<Option<ExitStatus>>,
    held_signals: RefCell<Vec<Signal>>,
}

impl PtraceTracee {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            reaped: Cell::new(None),
            held_signals: RefCell::new(Vec::new()),
        }
    }

    /// Exit status collected while stepping, if the thread died meanwhile
    pub fn take_reaped(&self) -> Option<ExitStatus> {
        self.reaped.take()
    }

    /// Signals that arrived while stepping and were held back
    pub fn take_held_signals(&self) -> Vec<Signal> {
        self.held_signals.take()
    }

    fn open_mem(&self, write: bool) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(proc_path(self.pid, "mem"))
            .map_err(|e| self.io_error(0, 0, e))
    }

    fn io_error(&self, addr: u64, len: usize, e: io::Error) -> TraceError {
        match e.raw_os_error() {
            Some(code) => TraceError::from_memory(self.pid, addr, len, Errno::from_raw(code)),
            None => TraceError::MemoryAccess {
                pid: self.pid,
                addr,
                len,
                reason: e.to_string(),
            },
        }
    }

    fn short_transfer(&self, addr: u64, len: usize, done: usize) -> TraceError {
        TraceError::MemoryAccess {
            pid: self.pid,
            addr,
            len,
            reason: format!("transfer stopped after {} bytes", done),
        }
    }

    /// Fallback for kernels or sandboxes where `process_vm_readv` is unavailable
    fn read_proc_mem(&self, addr: u64, buf: &mut [u8], mut done: usize) -> Result<()> {
        let mem = self.open_mem(false)?;
        while done < buf.len() {
            match mem.read_at(&mut buf[done..], addr + done as u64) {
                Ok(0) => return Err(self.short_transfer(addr, buf.len(), done)),
                Ok(n) => done += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(addr, buf.len(), e)),
            }
        }
        Ok(())
    }
}

impl Tracee for PtraceTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = alloc_buffer(self.pid, addr, len)?;
        let mut done = 0;

        // process_vm_readv may stop at a page boundary, so keep asking for the remainder
        while done < len {
            let remote = [RemoteIoVec {
                base: addr as usize + done,
                len: len - done,
            }];
            let res = {
                let mut local = [IoSliceMut::new(&mut buf[done..])];
                uio::process_vm_readv(self.pid, &mut local, &remote)
            };
            match res {
                Ok(0) => return Err(self.short_transfer(addr, len, done)),
                Ok(n) => done += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::ENOSYS) | Err(Errno::EPERM) => {
                    self.read_proc_mem(addr, &mut buf, done)?;
                    break;
                }
                Err(errno) => return Err(TraceError::from_memory(self.pid, addr, len, errno)),
            }
        }
        Ok(buf)
    }

    fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<usize> {
        // /proc/<pid>/mem lets the tracer write pages the tracee itself could not
        let mem = self.open_mem(true)?;
        let mut done = 0;
        while done < bytes.len() {
            match mem.write_at(&bytes[done..], addr + done as u64) {
                Ok(0) => return Err(self.short_transfer(addr, bytes.len(), done)),
                Ok(n) => done += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(addr, bytes.len(), e)),
            }
        }
        Ok(done)
    }

    fn registers(&self) -> Result<SyscallRegs> {
        ptrace::getregs(self.pid).map_err(|e| TraceError::from_ptrace("PTRACE_GETREGS", self.pid, e))
    }

    fn set_registers(&self, regs: &SyscallRegs) -> Result<()> {
        ptrace::setregs(self.pid, *regs)
            .map_err(|e| TraceError::from_ptrace("PTRACE_SETREGS", self.pid, e))
    }

    fn step_syscall(&self) -> Result<()> {
        let resume = |pid: Pid| {
            ptrace::syscall(pid, None).map_err(|e| TraceError::from_ptrace("PTRACE_SYSCALL", pid, e))
        };
        resume(self.pid)?;
        loop {
            match wait::waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::PtraceSyscall(_)) => return Ok(()),
                Ok(WaitStatus::Stopped(_, sig)) => {
                    debug!("Process {}: holding back {:?} while stepping", self.pid, sig);
                    self.held_signals.borrow_mut().push(sig);
                    resume(self.pid)?;
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    self.reaped.set(Some(ExitStatus::Exited(code)));
                    return Err(TraceError::ProcessGone(self.pid));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.reaped.set(Some(ExitStatus::Signaled(sig)));
                    return Err(TraceError::ProcessGone(self.pid));
                }
                Ok(WaitStatus::PtraceEvent(..)) => resume(self.pid)?,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(TraceError::from_ptrace("waitpid", self.pid, e)),
            }
        }
    }
}

/// Zeroed buffer for a read of `len` bytes, failing instead of aborting on huge lengths
fn alloc_buffer(pid: Pid, addr: u64, len: usize) -> Result<Vec<u8>> {
    let too_large = |reason: String| TraceError::MemoryAccess {
        pid,
        addr,
        len,
        reason,
    };
    if len > MAX_READ_LEN {
        return Err(too_large(format!("length exceeds the {} byte limit", MAX_READ_LEN)));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| too_large(e.to_string()))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Reads at most `max_len` bytes, stopping before the first NUL
///
/// Memory is read one page-bounded chunk at a time, so a string ending just before an unmapped
/// page can still be read. The flag tells whether a NUL was found.
fn read_until_nul(tracee: &dyn Tracee, addr: u64, max_len: usize) -> Result<(Vec<u8>, bool)> {
    let mut buf: Vec<u8> = Vec::with_capacity(max_len.min(256));
    let mut current = addr;
    while buf.len() < max_len {
        let chunk_len = ((PAGE_SIZE - current % PAGE_SIZE) as usize).min(max_len - buf.len());
        let chunk = tracee.read_bytes(current, chunk_len)?;
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            buf.extend_from_slice(&chunk[..nul]);
            return Ok((buf, true));
        }
        buf.extend_from_slice(&chunk);
        current += chunk_len as u64;
    }
    Ok((buf, false))
}

/// Reads a NUL-terminated string of at most `MAX_CSTR_LEN` bytes
pub fn read_cstr(tracee: &dyn Tracee, addr: u64) -> Result<String> {
    match read_until_nul(tracee, addr, MAX_CSTR_LEN)? {
        (buf, true) => Ok(String::from_utf8_lossy(&buf).into_owned()),
        (buf, false) => Err(TraceError::MemoryAccess {
            pid: tracee.pid(),
            addr,
            len: buf.len(),
            reason: String::from("null-terminated string not found"),
        }),
    }
}

/// Reads text of at most `len` bytes, ending early at the first NUL
pub fn read_str(tracee: &dyn Tracee, addr: u64, len: usize) -> Result<String> {
    let (buf, _) = read_until_nul(tracee, addr, len)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn proc_path(pid: Pid, entry: &str) -> String {
    format!("/proc/{}/{}", pid, entry)
}

fn read_nul_separated(pid: Pid, entry: &str) -> Result<Vec<String>> {
    let raw = fs::read(proc_path(pid, entry)).map_err(|e| match e.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ESRCH) => TraceError::ProcessGone(pid),
        _ => TraceError::Io(e),
    })?;
    Ok(split_nul(&raw))
}

fn split_nul(raw: &[u8]) -> Vec<String> {
    let trimmed = raw.strip_suffix(b"\0").unwrap_or(raw);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

pub fn read_argv(pid: Pid) -> Result<Vec<String>> {
    read_nul_separated(pid, "cmdline")
}

pub fn read_envs(pid: Pid) -> Result<Vec<String>> {
    read_nul_separated(pid, "environ")
}

/// Open file descriptors of `pid` and what they point to
pub fn read_fds(pid: Pid) -> Result<Vec<(i32, String)>> {
    let mut fds = Vec::new();
    for entry in fs::read_dir(proc_path(pid, "fd"))? {
        let entry = entry?;
        let fd = match entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            Some(fd) => fd,
            None => continue,
        };
        // The descriptor may be closed between listing and reading the link
        if let Ok(target) = fs::read_link(entry.path()) {
            fds.push((fd, target.to_string_lossy().into_owned()));
        }
    }
    fds.sort_by_key(|(fd, _)| *fd);
    Ok(fds)
}
