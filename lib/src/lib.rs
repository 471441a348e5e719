//! Programmable syscall interception for traced Linux processes.
//!
//! Hooks registered per syscall number run when a traced process stops at the syscall's entry
//! ("before") or exit ("after"). A hook can read and write the tracee's memory, keep state in a
//! per-process store and return a directive: replacement arguments, or a `ret`/`errno` pair that
//! skips the syscall (before) or replaces its result (after).

pub mod bridge;
mod child_process;
pub mod directive;
pub mod error;
pub mod hooks;
pub mod memory;
pub mod persistence;
pub mod platforms;
pub mod process_info;
pub mod process_state;
pub mod registers;
pub mod supervisor;
pub mod syscalls;
pub mod tracer_conf;

#[cfg(test)]
mod test_utils;

use log::info;
use std::sync::Arc;

pub use nix::unistd::Pid;

pub use crate::bridge::HookContext;
pub use crate::directive::OverrideDirective;
pub use crate::error::{Result, TraceError};
pub use crate::hooks::{Hook, HookRegistry};
pub use crate::persistence::{GlobalStore, PersistenceStore};
pub use crate::process_info::{FdInfo, PidInfo, SignalInfo, ThreadInfo};
pub use crate::process_state::{ExitStatus, ProcessExit};
pub use crate::supervisor::{DetachHandle, Supervisor};
pub use crate::syscalls::{Phase, SyscallEvent, SyscallResult};
pub use crate::tracer_conf::{RuntimeConf, TracerConf};

use crate::platforms::NativeHandler;
use crate::syscalls::SyscallHandler;

/// What happened to the processes of one trace, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub root: Pid,
    pub exits: Vec<ProcessExit>,
}

impl TraceReport {
    pub fn status_of(&self, pid: Pid) -> Option<ExitStatus> {
        self.exits.iter().find(|e| e.pid == pid).map(|e| e.status)
    }

    pub fn root_status(&self) -> Option<ExitStatus> {
        self.status_of(self.root)
    }
}

/// Entry point for tracing: a hook registry plus runtime configuration
///
/// Every method that starts a trace runs its control loop on the calling thread and returns when
/// no process of that trace is left under trace. Clones share hooks, the global store and the
/// detach handle.
#[derive(Clone)]
pub struct Tracer {
    handler: Arc<SyscallHandler>,
    kill_on_exit: bool,
    detach: DetachHandle,
}

impl Tracer {
    pub fn new(registry: HookRegistry, runtime_conf: RuntimeConf) -> Self {
        let kill_on_exit = runtime_conf.kill_on_exit;
        let handler = SyscallHandler::new(
            Arc::new(registry),
            Box::new(NativeHandler::new()),
            runtime_conf,
            GlobalStore::new(),
        );
        Self {
            handler: Arc::new(handler),
            kill_on_exit,
            detach: DetachHandle::new(),
        }
    }

    /// Store shared by the hooks of every process this tracer traces
    pub fn global_store(&self) -> &GlobalStore {
        self.handler.global_store()
    }

    pub fn detach_handle(&self) -> DetachHandle {
        self.detach.clone()
    }

    /// Runs `cmd` (searched in `PATH`) under trace
    pub fn spawn(&self, cmd: &[&str]) -> Result<TraceReport> {
        let child = child_process::spawn(cmd, self.kill_on_exit)?;
        info!("Tracing child process {} ({:?})", child, cmd);
        self.run(child)
    }

    /// Forks and traces a child running `f`, which exits with the returned code
    pub fn spawn_fn<F>(&self, f: F) -> Result<TraceReport>
    where
        F: FnOnce() -> i32,
    {
        let child = child_process::spawn_fn(f, self.kill_on_exit)?;
        info!("Tracing forked child process {}", child);
        self.run(child)
    }

    /// Traces an already running process, which keeps running if the tracer detaches
    pub fn attach(&self, pid: Pid) -> Result<TraceReport> {
        child_process::attach(pid)?;
        info!("Attached to process {}", pid);
        self.run(pid)
    }

    fn run(&self, root: Pid) -> Result<TraceReport> {
        // Await next child syscall for main tracee
        child_process::start(root)?;
        let processes = child_process::child_loop(root, &self.handler, &self.detach)?;
        Ok(TraceReport {
            root,
            exits: processes.into_exits(),
        })
    }
}

/// Loads the hooks described by `conf` and traces `cmd` with them
pub fn trace(cmd: &[&str], conf: &TracerConf, runtime_conf: RuntimeConf) -> Result<TraceReport> {
    let registry = conf.into_registry(&NativeHandler::new())?;
    Tracer::new(registry, runtime_conf).spawn(cmd)
}
