//! Error type shared by every layer of the tracer.

use nix::errno::Errno;
use nix::unistd::Pid;
use std::io;
use thiserror::Error;

use crate::process_state::AttachState;

pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Debug, Error)]
pub enum TraceError {
    /// A trace operation was requested while the tracee was not in a stop that allows it
    #[error("{op} is not valid while process is {state:?}")]
    InvalidState { op: &'static str, state: AttachState },

    /// The tracee's address range could not be read or written
    #[error("unable to access {len} bytes at 0x{addr:X} in process {pid}: {reason}")]
    MemoryAccess {
        pid: Pid,
        addr: u64,
        len: usize,
        reason: String,
    },

    /// The tracee exited while an operation on it was in progress
    #[error("process {0} is gone")]
    ProcessGone(Pid),

    /// A hook failed internally
    #[error("hook failed: {0}")]
    Handler(String),

    /// A hook returned a value that is not a valid override directive
    #[error("malformed directive: {0}")]
    MalformedDirective(String),

    #[error("{op} failed for process {pid}: {errno}")]
    Ptrace {
        op: &'static str,
        pid: Pid,
        errno: Errno,
    },

    #[error("unable to start tracee: {0}")]
    Spawn(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control thread {0} panicked")]
    ControlThread(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TraceError {
    /// Maps an errno returned by a ptrace request, `ESRCH` meaning the tracee no longer exists
    pub fn from_ptrace(op: &'static str, pid: Pid, errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => TraceError::ProcessGone(pid),
            _ => TraceError::Ptrace { op, pid, errno },
        }
    }

    /// Maps an errno returned by a memory transfer
    pub fn from_memory(pid: Pid, addr: u64, len: usize, errno: Errno) -> Self {
        match errno {
            Errno::ESRCH => TraceError::ProcessGone(pid),
            _ => TraceError::MemoryAccess {
                pid,
                addr,
                len,
                reason: errno.desc().to_string(),
            },
        }
    }

    pub fn is_process_gone(&self) -> bool {
        matches!(self, TraceError::ProcessGone(_))
    }
}

impl From<&str> for TraceError {
    fn from(s: &str) -> Self {
        TraceError::Handler(s.to_string())
    }
}

impl From<String> for TraceError {
    fn from(s: String) -> Self {
        TraceError::Handler(s)
    }
}
