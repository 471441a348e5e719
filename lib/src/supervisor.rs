use log::{info, warn};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{Result, TraceError};
use crate::{TraceReport, Tracer};

#[derive(Debug, Default)]
struct DetachRequests {
    all: AtomicBool,
    pids: Mutex<HashSet<Pid>>,
}

/// Asks control threads to detach processes at their next trap stop
///
/// Cheap to clone and safe to use from any thread, including signal-watching threads.
#[derive(Debug, Default, Clone)]
pub struct DetachHandle {
    requests: Arc<DetachRequests>,
}

impl DetachHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, pid: Pid) {
        self.lock_pids().insert(pid);
    }

    /// Detach every traced process, including children created from now on
    pub fn request_all(&self) {
        self.requests.all.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self, pid: Pid) -> bool {
        self.requests.all.load(Ordering::SeqCst) || self.lock_pids().contains(&pid)
    }

    fn lock_pids(&self) -> std::sync::MutexGuard<'_, HashSet<Pid>> {
        self.requests
            .pids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs one control thread per root tracee
///
/// Each thread traces its root and every process the root creates, since ptrace ties
/// auto-attached children to the thread tracing their parent.
pub struct Supervisor {
    tracer: Tracer,
    workers: Vec<(String, JoinHandle<Result<TraceReport>>)>,
}

impl Supervisor {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            tracer,
            workers: Vec::new(),
        }
    }

    pub fn detach_handle(&self) -> DetachHandle {
        self.tracer.detach_handle()
    }

    pub fn spawn(&mut self, cmd: Vec<String>) -> Result<()> {
        let name = format!("spawn:{}", cmd.first().map(String::as_str).unwrap_or(""));
        let tracer = self.tracer.clone();
        self.start(name, move || {
            let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
            tracer.spawn(&args)
        })
    }

    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        let tracer = self.tracer.clone();
        self.start(format!("attach:{}", pid), move || tracer.attach(pid))
    }

    fn start<F>(&mut self, name: String, run: F) -> Result<()>
    where
        F: FnOnce() -> Result<TraceReport> + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.clone()).spawn(run)?;
        info!("Started control thread {}", name);
        self.workers.push((name, handle));
        Ok(())
    }

    /// Joins every control thread, returning their reports in start order
    pub fn wait(self) -> Vec<Result<TraceReport>> {
        self.workers
            .into_iter()
            .map(|(name, handle)| match handle.join() {
                Ok(res) => res,
                Err(_) => {
                    warn!("Control thread {} panicked", name);
                    Err(TraceError::ControlThread(name))
                }
            })
            .collect()
    }
}
