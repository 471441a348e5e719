//! Starting tracees and the per-thread control loop that services their trap stops.

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use std::ffi::CString;

use crate::error::{Result, TraceError};
use crate::memory::PtraceTracee;
use crate::process_state::{AttachState, ExitStatus, PendingExit, ProcessList, TracedProcess};
use crate::supervisor::DetachHandle;
use crate::syscalls::SyscallHandler;

/// Exit code of a forked child whose exec failed
const EXEC_FAILED: i32 = 127;

/// Options set on every root tracee; children inherit them
pub fn trace_options(kill_on_exit: bool) -> ptrace::Options {
    // PTRACE_O_TRACESYSGOOD: recommended by strace README-linux-ptrace. Causes
    // WaitStatus::PtraceSyscall to be generated instead of WaitStatus::Stopped upon syscall in
    // tracee.
    let mut options = ptrace::Options::PTRACE_O_TRACESYSGOOD
        // Trace sub-processes of tracee
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEEXEC;
    if kill_on_exit {
        options |= ptrace::Options::PTRACE_O_EXITKILL;
    }
    options
}

/// Forks and execs `cmd` under trace, returning once the child is stopped at its exec
pub fn spawn(cmd: &[&str], kill_on_exit: bool) -> Result<Pid> {
    if cmd.is_empty() {
        return Err(TraceError::Spawn(String::from("empty command")));
    }
    // Everything the child needs is allocated before forking
    let argv = cmd
        .iter()
        .map(|arg| CString::new(*arg))
        .collect::<std::result::Result<Vec<CString>, _>>()
        .map_err(|e| TraceError::Spawn(format!("invalid argument: {}", e)))?;

    match unsafe { unistd::fork() }.map_err(|e| TraceError::Spawn(format!("fork failed: {}", e)))? {
        ForkResult::Parent { child } => {
            wait_initial_stop(child, Signal::SIGTRAP)?;
            setup(child, kill_on_exit)?;
            Ok(child)
        }
        ForkResult::Child => exec_child(&argv),
    }
}

/// Forks and runs `f` in the child under trace; the child exits with `f`'s return value
///
/// The child of a multi-threaded process may only use async-signal-safe operations, so `f`
/// should stick to raw syscalls.
pub fn spawn_fn<F>(f: F, kill_on_exit: bool) -> Result<Pid>
where
    F: FnOnce() -> i32,
{
    match unsafe { unistd::fork() }.map_err(|e| TraceError::Spawn(format!("fork failed: {}", e)))? {
        ForkResult::Parent { child } => {
            wait_initial_stop(child, Signal::SIGSTOP)?;
            setup(child, kill_on_exit)?;
            Ok(child)
        }
        ForkResult::Child => {
            if ptrace::traceme().is_err() {
                unsafe { libc::_exit(EXEC_FAILED) }
            }
            // Give the parent a chance to set options before the first syscall
            let _ = signal::raise(Signal::SIGSTOP);
            let code = f();
            unsafe { libc::_exit(code) }
        }
    }
}

/// Attaches to a running process; it keeps running natively if it is later detached
pub fn attach(pid: Pid) -> Result<()> {
    ptrace::attach(pid).map_err(|e| TraceError::from_ptrace("PTRACE_ATTACH", pid, e))?;
    wait_initial_stop(pid, Signal::SIGSTOP)?;
    setup(pid, false)
}

/// Resumes the root tracee until its first syscall stop
pub fn start(pid: Pid) -> Result<()> {
    ptrace::syscall(pid, None).map_err(|e| TraceError::from_ptrace("PTRACE_SYSCALL", pid, e))
}

fn exec_child(argv: &[CString]) -> ! {
    if ptrace::traceme().is_ok() {
        let _ = unistd::execvp(&argv[0], argv);
    }
    unsafe { libc::_exit(EXEC_FAILED) }
}

fn setup(pid: Pid, kill_on_exit: bool) -> Result<()> {
    ptrace::setoptions(pid, trace_options(kill_on_exit))
        .map_err(|e| TraceError::from_ptrace("PTRACE_SETOPTIONS", pid, e))
}

/// Waits for the stop that makes `pid` traceable, passing on any other signal it gets first
fn wait_initial_stop(pid: Pid, expected: Signal) -> Result<()> {
    loop {
        match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, sig)) if sig == expected => return Ok(()),
            Ok(WaitStatus::Stopped(_, sig)) => {
                debug!("Process {} got {:?} before tracing started", pid, sig);
                ptrace::cont(pid, sig).map_err(|e| TraceError::from_ptrace("PTRACE_CONT", pid, e))?;
            }
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(TraceError::Spawn(format!(
                    "process {} exited with status {} before tracing started",
                    pid, code
                )))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Err(TraceError::Spawn(format!(
                    "process {} was killed by {:?} before tracing started",
                    pid, sig
                )))
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(TraceError::from_ptrace("waitpid", pid, e)),
        }
    }
}

/// Services every stop of `root` and the processes it creates until none is left under trace
///
/// Must run on the thread that started tracing `root`: ptrace binds a tracee, and the children
/// it auto-attaches, to that thread.
pub fn child_loop(root: Pid, handler: &SyscallHandler, detach: &DetachHandle) -> Result<ProcessList> {
    let mut processes = ProcessList::new();
    processes.insert(TracedProcess::new(root, None, AttachState::Running));

    while !processes.is_empty() {
        // __WNOTHREAD: tracees of other control threads are not ours to reap
        let status = match wait::waitpid(None, Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD)) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                warn!("No traced process left to wait for ({} still listed)", processes.len());
                break;
            }
            Err(e) => return Err(TraceError::from_ptrace("waitpid", root, e)),
        };

        match status {
            WaitStatus::Exited(pid, code) => on_exit(&mut processes, pid, ExitStatus::Exited(code)),
            WaitStatus::Signaled(pid, sig, _) => {
                on_exit(&mut processes, pid, ExitStatus::Signaled(sig))
            }
            WaitStatus::PtraceSyscall(pid) => on_syscall_stop(&mut processes, pid, handler, detach),
            WaitStatus::PtraceEvent(pid, _, event) => on_event(&mut processes, pid, event, detach),
            WaitStatus::Stopped(pid, sig) => on_signal_stop(&mut processes, pid, sig, detach),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => (),
        }
    }

    Ok(processes)
}

fn on_exit(processes: &mut ProcessList, pid: Pid, status: ExitStatus) {
    match processes.remove(pid, status) {
        Some(_) => info!("Process {} {}", pid, status),
        None => debug!("Ignoring exit of untraced process {}", pid),
    }
}

fn on_syscall_stop(processes: &mut ProcessList, pid: Pid, handler: &SyscallHandler, detach: &DetachHandle) {
    if !processes.contains(pid) {
        warn!("Syscall stop of unknown process {}; tracing it", pid);
        processes.insert(TracedProcess::new(pid, None, AttachState::Running));
    }
    let tracee = PtraceTracee::new(pid);

    if detach.is_requested(pid) {
        if let Some(process) = processes.get_mut(pid) {
            // The injected result of a skipped syscall still has to reach the tracee
            if matches!(process.pending, Some(PendingExit::Skipped(_))) {
                if let Err(e) = handler.handle_post_syscall(&tracee, process) {
                    warn!("Unable to complete skipped syscall of process {}: {}", pid, e);
                }
            }
        }
        detach_process(processes, pid, None);
        return;
    }

    let res = match processes.get_mut(pid) {
        Some(process) if process.in_syscall() => handler.handle_post_syscall(&tracee, process),
        Some(process) => handler.handle_pre_syscall(&tracee, process),
        None => return,
    };

    // A hook that ran a syscall in the tracee may have collected its exit
    if let Some(status) = tracee.take_reaped() {
        on_exit(processes, pid, status);
        return;
    }
    for sig in tracee.take_held_signals() {
        if let Err(e) = signal::kill(pid, sig) {
            warn!("Unable to deliver {:?} to process {}: {}", sig, pid, e);
        }
    }

    match res {
        Ok(_) => resume(processes, pid, None),
        Err(e) if e.is_process_gone() => debug!("Process {} went away during a syscall stop", pid),
        Err(e) => {
            error!("Process {}: {}; detaching", pid, e);
            detach_process(processes, pid, None);
        }
    }
}

fn on_event(processes: &mut ProcessList, pid: Pid, event: i32, detach: &DetachHandle) {
    if event == ptrace::Event::PTRACE_EVENT_FORK as i32
        || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
        || event == ptrace::Event::PTRACE_EVENT_CLONE as i32
    {
        match ptrace::getevent(pid) {
            Ok(raw) => {
                let child = Pid::from_raw(raw as libc::pid_t);
                info!("Process {} created child {}", pid, child);
                processes.add_child(pid, child);
            }
            Err(e) => warn!("Unable to get new child of process {}: {}", pid, e),
        }
    } else if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
        info!("Process {} executed a new program", pid);
        if let Some(process) = processes.get_mut(pid) {
            process.reset_after_exec();
        }
    } else {
        trace!("Process {}: ptrace event {}", pid, event);
    }

    if detach.is_requested(pid) {
        detach_process(processes, pid, None);
    } else {
        resume(processes, pid, None);
    }
}

fn on_signal_stop(processes: &mut ProcessList, pid: Pid, sig: Signal, detach: &DetachHandle) {
    let attach_stop = match processes.get_mut(pid) {
        Some(process) if process.state == AttachState::Attaching => {
            process.state = AttachState::Running;
            sig == Signal::SIGSTOP
        }
        Some(_) => false,
        None => {
            // A new child can report its first stop before its parent's fork event
            debug!("Process {} stopped before its creation was reported", pid);
            processes.insert(TracedProcess::new(pid, None, AttachState::Running));
            sig == Signal::SIGSTOP
        }
    };

    if attach_stop {
        if detach.is_requested(pid) {
            detach_process(processes, pid, None);
        } else {
            resume(processes, pid, None);
        }
        return;
    }

    if detach.is_requested(pid) {
        detach_process(processes, pid, Some(sig));
        return;
    }

    let inject = if is_group_stop(pid, sig) {
        None
    } else {
        Some(sig)
    };
    trace!("Process {} received {:?}", pid, sig);
    resume(processes, pid, inject);
}

/// A group stop has no siginfo; resuming it with a signal would deliver that signal twice
fn is_group_stop(pid: Pid, sig: Signal) -> bool {
    matches!(
        sig,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    ) && matches!(ptrace::getsiginfo(pid), Err(Errno::EINVAL))
}

fn resume(processes: &mut ProcessList, pid: Pid, sig: Option<Signal>) {
    if let Some(process) = processes.get_mut(pid) {
        process.state = AttachState::Running;
    }
    match ptrace::syscall(pid, sig) {
        Ok(()) => (),
        // Killed while stopped; its exit status is still to be reaped
        Err(Errno::ESRCH) => debug!("Process {} is gone, not resuming", pid),
        Err(e) => error!("Unable to resume process {}: {}", pid, e),
    }
}

/// Lets `pid` run natively from here on; its store goes with it
fn detach_process(processes: &mut ProcessList, pid: Pid, sig: Option<Signal>) {
    match ptrace::detach(pid, sig) {
        Ok(()) => info!("Detached from process {}", pid),
        Err(Errno::ESRCH) => debug!("Process {} is gone, nothing to detach", pid),
        Err(e) => error!("Unable to detach from process {}: {}", pid, e),
    }
    processes.remove(pid, ExitStatus::Detached);
}
