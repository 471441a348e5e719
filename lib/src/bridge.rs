//! What a hook sees of the tracer: the syscall, the stopped tracee's memory and metadata, and
//! the persistence stores.

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::directive::OverrideDirective;
use crate::error::{Result, TraceError};
use crate::hooks::Hook;
use crate::memory::{self, Tracee};
use crate::persistence::GlobalStore;
use crate::persistence::PersistenceStore;
use crate::platforms::PlatformHandler;
use crate::process_info::{self, FdInfo, PidInfo, SignalInfo, ThreadInfo};
use crate::process_state::TracedProcess;
use crate::registers;
use crate::syscalls::{Phase, SyscallEvent, SyscallResult};

/// Handle passed to a hook for the duration of one invocation
///
/// Only valid while the tracee is stopped at the syscall the hook was invoked for.
pub struct HookContext<'a> {
    tracee: &'a dyn Tracee,
    platform: &'a dyn PlatformHandler,
    process: &'a mut TracedProcess,
    global: &'a GlobalStore,
    event: &'a SyscallEvent,
}

impl<'a> HookContext<'a> {
    pub fn new(
        tracee: &'a dyn Tracee,
        platform: &'a dyn PlatformHandler,
        process: &'a mut TracedProcess,
        global: &'a GlobalStore,
        event: &'a SyscallEvent,
    ) -> Self {
        Self {
            tracee,
            platform,
            process,
            global,
            event,
        }
    }

    pub fn pid(&self) -> Pid {
        self.process.pid
    }

    pub fn sysno(&self) -> u64 {
        self.event.sysno
    }

    pub fn phase(&self) -> Phase {
        self.event.phase
    }

    pub fn event(&self) -> &SyscallEvent {
        self.event
    }

    /// The result the tracee will observe so far; `None` before the syscall ran
    pub fn result(&self) -> Option<SyscallResult> {
        self.event.result
    }

    pub fn ret(&self) -> Option<i64> {
        self.event.result.map(|r| r.ret)
    }

    pub fn errno(&self) -> Option<i64> {
        self.event.result.map(|r| r.errno)
    }

    /// Command line of the tracee, cached until it execs
    pub fn get_argv(&mut self) -> Result<Vec<String>> {
        let tracee = self.tracee;
        Ok(self.process.argv_with(|| tracee.argv())?.to_vec())
    }

    pub fn get_envs(&self) -> Result<Vec<String>> {
        self.tracee.envs()
    }

    /// Contents of the tracee's memory map listing
    pub fn get_mmaps(&self) -> Result<String> {
        self.tracee.mmaps()
    }

    pub fn get_fds(&self) -> Result<Vec<(i32, String)>> {
        self.tracee.fds()
    }

    pub fn get_fd_info(&self, fd: i32) -> Result<FdInfo> {
        self.tracee.fd_info(fd)
    }

    /// Signal masks and dispositions of the tracee
    pub fn get_signal_info(&self) -> Result<SignalInfo> {
        Ok(SignalInfo::from_status(&self.tracee.status()?))
    }

    /// Ids and session of the tracee
    pub fn get_pid_info(&self) -> Result<PidInfo> {
        let status = self.tracee.status()?;
        process_info::read_pid_info(self.pid(), &status)
    }

    /// Every thread of the tracee's thread group
    pub fn get_threads(&self) -> Result<Vec<ThreadInfo>> {
        self.tracee.threads()
    }

    pub fn get_thread_info(&self, tid: Pid) -> Result<ThreadInfo> {
        self.tracee
            .threads()?
            .into_iter()
            .find(|t| t.tid == tid.as_raw())
            .ok_or_else(|| {
                TraceError::Handler(format!("{} is not a thread of process {}", tid, self.pid()))
            })
    }

    /// Sends `sig` to the process `pid`
    pub fn send_signal(&self, pid: Pid, sig: Signal) -> Result<()> {
        signal::kill(pid, sig).map_err(|e| TraceError::from_ptrace("kill", pid, e))
    }

    pub fn signal_by_name(&self, name: &str) -> Result<Signal> {
        process_info::signal_by_name(name)
    }

    /// Maps `len` bytes of private anonymous read-write memory in the tracee
    ///
    /// The tracee runs an `mmap` before it continues with the syscall it is stopped at.
    pub fn anon_mmap(&self, len: u64) -> Result<u64> {
        let prot = (libc::PROT_READ | libc::PROT_WRITE) as u64;
        let flags = (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64;
        let res = self.inject("mmap", &[0, len, prot, flags, u64::MAX, 0])?;
        Ok(res.ret as u64)
    }

    /// Unmaps `len` bytes at `addr` in the tracee
    pub fn munmap(&self, addr: u64, len: u64) -> Result<()> {
        self.inject("munmap", &[addr, len]).map(|_| ())
    }

    fn inject(&self, name: &str, args: &[u64]) -> Result<SyscallResult> {
        let sysno = self
            .platform
            .syscall_number_by_name(name)
            .ok_or_else(|| TraceError::Handler(format!("no {} syscall on this platform", name)))?;
        let res =
            registers::inject_syscall(self.tracee, self.platform, self.process.state, sysno, args)?;
        if res.errno != 0 {
            return Err(TraceError::Handler(format!(
                "{} failed in process {}: {}",
                name,
                self.pid(),
                Errno::from_raw(res.errno as i32)
            )));
        }
        Ok(res)
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.tracee.read_bytes(addr, len)
    }

    /// Reads text of at most `len` bytes, ending early at a NUL; invalid UTF-8 is replaced
    pub fn read_string(&self, addr: u64, len: usize) -> Result<String> {
        memory::read_str(self.tracee, addr, len)
    }

    pub fn read_cstr(&self, addr: u64) -> Result<String> {
        memory::read_cstr(self.tracee, addr)
    }

    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<usize> {
        self.tracee.write_bytes(addr, bytes)
    }

    /// Writes the string's bytes without a terminating NUL and returns how many were written
    pub fn write_string(&self, addr: u64, s: &str) -> Result<usize> {
        self.tracee.write_bytes(addr, s.as_bytes())
    }

    /// Store private to the traced process; other processes never see these entries
    pub fn persistence_local(&mut self) -> &mut PersistenceStore {
        self.process.store_mut()
    }

    /// Store shared by every traced process
    pub fn persistence_global(&self) -> &GlobalStore {
        self.global
    }

    /// Logs a message on behalf of the hook, tagged with the process it runs for
    pub fn log(&self, msg: &str) {
        info!("[{}] {}", self.process.pid, msg);
    }

    /// Logs one JSON record holding `msg` and the syscall the hook runs for
    pub fn log_json(&self, msg: &Value) {
        info!("{}", self.log_record(msg));
    }

    fn log_record(&self, msg: &Value) -> Value {
        json!({
            "pid": self.process.pid.as_raw(),
            "sysno": self.event.sysno,
            "syscall": self.platform.syscall_name(self.event.sysno),
            "phase": self.event.phase,
            "msg": msg,
        })
    }
}

/// Calls `hook` with the arguments marshaled for it and validates what it returns
///
/// A panic inside the hook is caught and reported as a `Handler` error.
pub(crate) fn invoke(
    hook: &Hook,
    ctx: &mut HookContext<'_>,
    args: &[u64],
) -> Result<Option<OverrideDirective>> {
    let values: Vec<Value> = args.iter().map(|a| Value::from(*a)).collect();
    let res = panic::catch_unwind(AssertUnwindSafe(|| hook.call(ctx, &values)))
        .map_err(|payload| TraceError::Handler(format!("panicked: {}", panic_message(&*payload))))?;
    match res? {
        Some(value) => OverrideDirective::from_value(&value),
        None => Ok(None),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        warn!("Hook panicked with a non-string payload");
        String::from("unknown panic")
    }
}
