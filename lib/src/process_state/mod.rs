use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::persistence::PersistenceStore;
use crate::syscalls::{SyscallEvent, SyscallResult};

/// Where a traced process is in its trace lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Attaching,
    Running,
    StoppedAtEntry,
    StoppedAtExit,
    Detached,
    Exited,
}

/// What the exit stop of the syscall currently in flight has to do
#[derive(Debug, Clone, PartialEq)]
pub enum PendingExit {
    /// No hooks ran at entry; the exit stop still runs after-hooks if there are any
    Passthrough(SyscallEvent),

    /// Before-hooks ran; the event carries the arguments the kernel actually received
    Dispatched(SyscallEvent),

    /// The syscall was skipped; its exit stop only writes the injected result
    Skipped(SyscallResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
    Detached,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with status {}", code),
            ExitStatus::Signaled(sig) => write!(f, "killed by {:?}", sig),
            ExitStatus::Detached => write!(f, "detached"),
        }
    }
}

/// Notification that a traced process left the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: Pid,
    pub status: ExitStatus,
}

/// One process (or thread) under trace
#[derive(Debug)]
pub struct TracedProcess {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub state: AttachState,
    pub children: Vec<Pid>,
    store: Option<PersistenceStore>,
    argv: Option<Vec<String>>,
    pub(crate) pending: Option<PendingExit>,
    pub(crate) instrumented: Option<bool>,
}

impl TracedProcess {
    pub fn new(pid: Pid, parent: Option<Pid>, state: AttachState) -> Self {
        Self {
            pid,
            parent,
            state,
            children: Vec::new(),
            store: None,
            argv: None,
            pending: None,
            instrumented: None,
        }
    }

    /// The process's local store, created on first access
    pub fn store_mut(&mut self) -> &mut PersistenceStore {
        self.store.get_or_insert_with(PersistenceStore::new)
    }

    pub fn store(&self) -> Option<&PersistenceStore> {
        self.store.as_ref()
    }

    /// Returns the cached argv, reading it with `read` the first time
    pub fn argv_with<F>(&mut self, read: F) -> Result<&[String]>
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        if self.argv.is_none() {
            self.argv = Some(read()?);
        }
        Ok(self.argv.as_deref().unwrap_or_default())
    }

    /// A successful exec replaces the program image, so metadata derived from it is stale
    pub fn reset_after_exec(&mut self) {
        self.argv = None;
        self.instrumented = None;
    }

    pub fn in_syscall(&self) -> bool {
        self.pending.is_some()
    }
}

/// Every process traced by one control thread, plus the exits seen so far
#[derive(Debug, Default)]
pub struct ProcessList {
    processes: HashMap<Pid, TracedProcess>,
    exits: Vec<ProcessExit>,
}

impl ProcessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, process: TracedProcess) {
        self.processes.insert(process.pid, process);
    }

    /// Registers `child` as discovered through a fork/clone event of `parent`
    ///
    /// The child may already be known if its attach stop was reported before the parent's
    /// event; in that case only the parent link is filled in.
    pub fn add_child(&mut self, parent: Pid, child: Pid) {
        self.processes
            .entry(child)
            .and_modify(|p| p.parent = Some(parent))
            .or_insert_with(|| TracedProcess::new(child, Some(parent), AttachState::Attaching));
        if let Some(p) = self.processes.get_mut(&parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&TracedProcess> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut TracedProcess> {
        self.processes.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Drops the process (and with it its store) and records why it left
    pub fn remove(&mut self, pid: Pid, status: ExitStatus) -> Option<TracedProcess> {
        let mut process = self.processes.remove(&pid)?;
        process.state = match status {
            ExitStatus::Detached => AttachState::Detached,
            _ => AttachState::Exited,
        };
        if let Some(parent) = process.parent.and_then(|ppid| self.processes.get_mut(&ppid)) {
            parent.children.retain(|c| *c != pid);
        }
        self.exits.push(ProcessExit { pid, status });
        Some(process)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn exits(&self) -> &[ProcessExit] {
        &self.exits
    }

    pub fn into_exits(self) -> Vec<ProcessExit> {
        self.exits
    }
}
