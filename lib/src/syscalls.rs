use log::{debug, trace, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::bridge::{self, HookContext};
use crate::directive::OverrideDirective;
use crate::error::Result;
use crate::hooks::{HookRegistration, HookRegistry};
use crate::memory::Tracee;
use crate::persistence::GlobalStore;
use crate::platforms::{PlatformHandler, MAX_ARGS};
use crate::process_state::{AttachState, PendingExit, TracedProcess};
use crate::registers::RegisterAccessor;
use crate::tracer_conf::RuntimeConf;

pub type SyscallRegs = libc::user_regs_struct;

/// Largest errno the kernel encodes in a syscall return register
pub const MAX_ERRNO: i64 = 4095;

/// Kernel-internal errnos (`ERESTARTSYS` through `ERESTART_RESTARTBLOCK`) asking for the
/// interrupted syscall to be restarted; the calling program never sees them
const RESTART_ERRNOS: std::ops::RangeInclusive<i64> = 512..=516;

/// When a hook runs relative to the syscall's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// At syscall entry, before the kernel executes it
    Before,
    /// At syscall exit, after the kernel executed it
    After,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Before => write!(f, "before"),
            Phase::After => write!(f, "after"),
        }
    }
}

/// Return value and errno of a syscall as the calling program sees them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallResult {
    pub ret: i64,
    pub errno: i64,
}

impl SyscallResult {
    pub fn new(ret: i64, errno: i64) -> Self {
        Self { ret, errno }
    }

    /// Decodes the raw return register: values in `-4095..=-1` are negated errnos
    pub fn from_raw(raw: u64) -> Self {
        let value = raw as i64;
        if (-MAX_ERRNO..=-1).contains(&value) {
            Self { ret: -1, errno: -value }
        } else {
            Self { ret: value, errno: 0 }
        }
    }

    /// The syscall was interrupted and the kernel is about to restart it or turn it into `EINTR`
    pub fn is_restart(&self) -> bool {
        RESTART_ERRNOS.contains(&self.errno)
    }

    /// Encodes for the return register; a non-zero errno wins over `ret`, since the kernel can
    /// only report failure as `-errno` (libc turns that into `-1` plus `errno`)
    pub fn to_raw(self) -> u64 {
        if self.errno != 0 {
            (-self.errno.abs()) as u64
        } else {
            self.ret as u64
        }
    }
}

/// Snapshot of a syscall at an entry or exit stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallEvent {
    pub pid: Pid,
    pub sysno: u64,
    pub args: [u64; MAX_ARGS],
    pub phase: Phase,

    /// Only set for `Phase::After`
    pub result: Option<SyscallResult>,
}

/// What the dispatcher did to one syscall stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleSyscallResult {
    Unchanged,
    ArgumentsReplaced(usize),
    Skipped(SyscallResult),
    ResultReplaced(SyscallResult),
}

/// Runs the hooks registered for a syscall stop and applies what they ask for
pub struct SyscallHandler {
    registry: Arc<HookRegistry>,
    platform: Box<dyn PlatformHandler>,
    runtime_conf: RuntimeConf,
    global: GlobalStore,
}

impl SyscallHandler {
    pub fn new(
        registry: Arc<HookRegistry>,
        platform: Box<dyn PlatformHandler>,
        runtime_conf: RuntimeConf,
        global: GlobalStore,
    ) -> Self {
        Self {
            registry,
            platform,
            runtime_conf,
            global,
        }
    }

    pub fn global_store(&self) -> &GlobalStore {
        &self.global
    }

    pub fn platform(&self) -> &dyn PlatformHandler {
        &*self.platform
    }

    /// Entry stop: before-hooks run in registration order, each seeing the arguments as
    /// rewritten by the ones before it; the first hook asking for a skip ends the chain
    pub fn handle_pre_syscall(
        &self,
        tracee: &dyn Tracee,
        process: &mut TracedProcess,
    ) -> Result<HandleSyscallResult> {
        process.state = AttachState::StoppedAtEntry;
        let mut regs = RegisterAccessor::load(tracee, self.platform(), process.state)?;
        let event = regs.syscall_event()?;

        let hooks = self.registry.lookup(event.sysno, Phase::Before);
        if hooks.is_empty() || !self.instrumented(tracee, process) {
            trace!("{}", self.describe(&event));
            process.pending = Some(PendingExit::Passthrough(event));
            return Ok(HandleSyscallResult::Unchanged);
        }

        let mut current = event;
        let mut aggregate = OverrideDirective::default();
        for registration in hooks {
            let directive = match self.run_hook(registration, tracee, process, &current) {
                Some(d) => d,
                None => continue,
            };
            if let Some(result) = directive.result {
                if !directive.args.is_empty() {
                    debug!(
                        " - Hook {} asked for a skip and argument overrides; ignoring the arguments",
                        registration.name()
                    );
                }
                aggregate.result = Some(result);
                debug!(
                    " - Hook {} skips {}; remaining before-hooks not run",
                    registration.name(),
                    self.syscall_label(current.sysno)
                );
                break;
            }
            for (&index, &value) in &directive.args {
                current.args[index] = value;
                aggregate.args.insert(index, value);
            }
        }

        let res = aggregate.apply(&mut regs)?;
        if res != HandleSyscallResult::Unchanged {
            debug!("Process {}: {} {:?}", process.pid, self.syscall_label(current.sysno), res);
        }
        process.pending = Some(match res {
            HandleSyscallResult::Skipped(result) => PendingExit::Skipped(result),
            _ => PendingExit::Dispatched(current),
        });
        Ok(res)
    }

    /// Exit stop: writes the injected result of a skipped syscall, or runs the after-hooks; the
    /// last explicit result returned by an after-hook is what the tracee observes
    pub fn handle_post_syscall(
        &self,
        tracee: &dyn Tracee,
        process: &mut TracedProcess,
    ) -> Result<HandleSyscallResult> {
        process.state = AttachState::StoppedAtExit;
        let pending = process.pending.take();
        let mut regs = RegisterAccessor::load(tracee, self.platform(), process.state)?;

        let entry = match pending {
            Some(PendingExit::Skipped(result)) => {
                regs.set_return_and_errno(result)?;
                return Ok(HandleSyscallResult::Skipped(result));
            }
            Some(PendingExit::Passthrough(entry)) | Some(PendingExit::Dispatched(entry)) => entry,
            None => {
                // Exit of a syscall that was already in progress when tracing began
                trace!("Process {}: exit stop without a matching entry", process.pid);
                return Ok(HandleSyscallResult::Unchanged);
            }
        };

        let observed = regs.syscall_event()?;
        let mut current = SyscallEvent {
            phase: Phase::After,
            result: observed.result,
            ..entry
        };

        if current.result.map_or(false, |r| r.is_restart()) {
            // The restarted call gets entry and exit stops of its own
            debug!(
                "Process {}: {} interrupted, not running after-hooks",
                process.pid,
                self.syscall_label(current.sysno)
            );
            return Ok(HandleSyscallResult::Unchanged);
        }

        let hooks = self.registry.lookup(current.sysno, Phase::After);
        if hooks.is_empty() || !self.instrumented(tracee, process) {
            if let Some(result) = current.result {
                trace!(" - {} = {} (errno {})", self.syscall_label(current.sysno), result.ret, result.errno);
            }
            return Ok(HandleSyscallResult::Unchanged);
        }

        let mut aggregate = OverrideDirective::default();
        for registration in hooks {
            let directive = match self.run_hook(registration, tracee, process, &current) {
                Some(d) => d,
                None => continue,
            };
            if !directive.args.is_empty() {
                debug!(
                    " - Hook {} returned argument overrides after the syscall ran; ignored",
                    registration.name()
                );
            }
            if let Some(result) = directive.result {
                current.result = Some(result);
                aggregate.result = Some(result);
            }
        }

        let res = aggregate.apply(&mut regs)?;
        if res != HandleSyscallResult::Unchanged {
            debug!("Process {}: {} {:?}", process.pid, self.syscall_label(current.sysno), res);
        }
        Ok(res)
    }

    /// Invokes one hook, isolating its failure: an error, a panic or a malformed directive is
    /// logged and counts as no directive
    fn run_hook(
        &self,
        registration: &HookRegistration,
        tracee: &dyn Tracee,
        process: &mut TracedProcess,
        event: &SyscallEvent,
    ) -> Option<OverrideDirective> {
        let pid = process.pid;
        let mut ctx = HookContext::new(tracee, self.platform(), process, &self.global, event);
        match bridge::invoke(registration.hook(), &mut ctx, &event.args) {
            Ok(directive) => directive,
            Err(e) => {
                warn!(
                    "Hook {} for {} failed in process {}: {}",
                    registration.name(),
                    self.syscall_label(event.sysno),
                    pid,
                    e
                );
                None
            }
        }
    }

    /// Applies the runtime process filter, caching the decision until the next exec
    fn instrumented(&self, tracee: &dyn Tracee, process: &mut TracedProcess) -> bool {
        let filter = match self.runtime_conf.process_filter {
            Some(ref f) => f,
            None => return true,
        };
        if let Some(decision) = process.instrumented {
            return decision;
        }
        let pid = process.pid;
        match process.argv_with(|| tracee.argv()) {
            Ok(argv) => {
                let decision = filter(argv);
                debug!("Process {} {:?} instrumented: {}", pid, argv, decision);
                process.instrumented = Some(decision);
                decision
            }
            Err(e) => {
                debug!("Unable to read argv of process {}: {}", pid, e);
                false
            }
        }
    }

    fn syscall_label(&self, sysno: u64) -> String {
        match self.platform.syscall_name(sysno) {
            Some(name) => format!("{} ({})", name, sysno),
            None => format!("syscall {}", sysno),
        }
    }

    fn describe(&self, event: &SyscallEvent) -> String {
        format!(
            "Process {}: {} ({:X}, {:X}, {:X}, {:X}, {:X}, {:X})",
            event.pid,
            self.syscall_label(event.sysno),
            event.args[0],
            event.args[1],
            event.args[2],
            event.args[3],
            event.args[4],
            event.args[5],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::NativeHandler;
    use crate::test_utils::{entry_regs, MockTracee};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const BASE: u64 = 0x10000;

    fn handler(registry: HookRegistry) -> SyscallHandler {
        handler_with_conf(registry, RuntimeConf::default())
    }

    fn handler_with_conf(registry: HookRegistry, conf: RuntimeConf) -> SyscallHandler {
        SyscallHandler::new(
            Arc::new(registry),
            Box::new(NativeHandler::new()),
            conf,
            GlobalStore::new(),
        )
    }

    fn process(tracee: &MockTracee) -> TracedProcess {
        TracedProcess::new(tracee.pid(), None, AttachState::Running)
    }

    /// Emulates the kernel between the two stops: a skipped call gets -ENOSYS, anything else
    /// gets `result`
    fn kernel_runs(tracee: &MockTracee, result: u64) {
        let mut regs = tracee.registers().unwrap();
        regs.rax = if regs.orig_rax == u64::MAX {
            (-libc::ENOSYS as i64) as u64
        } else {
            result
        };
        tracee.set_registers(&regs).unwrap();
    }

    #[test]
    fn result_encoding() {
        assert_eq!(SyscallResult::from_raw((-98i64) as u64), SyscallResult::new(-1, 98));
        assert_eq!(SyscallResult::from_raw(5), SyscallResult::new(5, 0));
        assert_eq!(SyscallResult::from_raw((-5000i64) as u64), SyscallResult::new(-5000, 0));
        assert_eq!(SyscallResult::new(-1, 98).to_raw(), (-98i64) as u64);
        assert_eq!(SyscallResult::new(0, 0).to_raw(), 0);
        assert_eq!(SyscallResult::new(42, 0).to_raw(), 42);
        assert!(SyscallResult::from_raw((-512i64) as u64).is_restart());
        assert!(SyscallResult::from_raw((-516i64) as u64).is_restart());
        assert!(!SyscallResult::from_raw((-(libc::EINTR as i64)) as u64).is_restart());
    }

    #[test]
    fn no_hooks_is_pass_through() {
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(libc::SYS_write as u64, [1, BASE, 5, 0, 0, 0])).unwrap();
        let h = handler(HookRegistry::new());
        let mut p = process(&tracee);
        let before = tracee.registers().unwrap();
        let writes = tracee.register_writes();

        assert_eq!(h.handle_pre_syscall(&tracee, &mut p).unwrap(), HandleSyscallResult::Unchanged);
        assert_eq!(tracee.registers().unwrap().rdx, before.rdx);
        assert_eq!(tracee.registers().unwrap().orig_rax, before.orig_rax);
        assert_eq!(tracee.register_writes(), writes);

        kernel_runs(&tracee, 5);
        assert_eq!(h.handle_post_syscall(&tracee, &mut p).unwrap(), HandleSyscallResult::Unchanged);
        assert_eq!(tracee.registers().unwrap().rax, 5);
        assert!(p.pending.is_none());
    }

    #[test]
    fn before_hook_skip_injects_result() {
        let mut registry = HookRegistry::new();
        let after_calls = Arc::new(AtomicUsize::new(0));
        let counter = after_calls.clone();
        registry.add_cb_before(49, |_, _| Ok(Some(json!({"ret": -1, "errno": 98}))));
        registry.add_cb_after(49, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(49, [3, BASE, 16, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);

        let res = h.handle_pre_syscall(&tracee, &mut p).unwrap();
        assert_eq!(res, HandleSyscallResult::Skipped(SyscallResult::new(-1, 98)));
        assert_eq!(tracee.registers().unwrap().orig_rax, u64::MAX);

        kernel_runs(&tracee, 0);
        let res = h.handle_post_syscall(&tracee, &mut p).unwrap();
        assert_eq!(res, HandleSyscallResult::Skipped(SyscallResult::new(-1, 98)));
        assert_eq!(tracee.registers().unwrap().rax as i64, -98);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn argument_override_replaces_only_that_argument() {
        let mut registry = HookRegistry::new();
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"0": 7}))));
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(1, [1, BASE, 5, 9, 8, 7])).unwrap();
        let mut p = process(&tracee);

        assert_eq!(
            h.handle_pre_syscall(&tracee, &mut p).unwrap(),
            HandleSyscallResult::ArgumentsReplaced(1)
        );
        let regs = tracee.registers().unwrap();
        assert_eq!(
            NativeHandler::new().arguments(&regs),
            [7, BASE, 5, 9, 8, 7]
        );
        assert_eq!(regs.orig_rax, 1);
    }

    #[test]
    fn later_hooks_see_earlier_overrides() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"2": 3}))));
        let log = seen.clone();
        registry.add_cb_before(1, move |_, args| {
            log.lock().unwrap().push(args[2].clone());
            Ok(Some(json!({"2": args[2].as_u64().unwrap() + 1})))
        });
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(1, [1, BASE, 11, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);

        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!(3)]);
        assert_eq!(tracee.registers().unwrap().rdx, 4);
        match p.pending {
            Some(PendingExit::Dispatched(ref e)) => assert_eq!(e.args[2], 4),
            ref other => panic!("unexpected pending {:?}", other),
        }
    }

    #[test]
    fn first_skip_short_circuits_remaining_before_hooks() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"2": 1}))));
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"ret": 5, "errno": 0, "0": 9}))));
        let counter = ran.clone();
        registry.add_cb_before(1, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!({"ret": -1, "errno": 1})))
        });
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(1, [1, BASE, 11, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);

        let res = h.handle_pre_syscall(&tracee, &mut p).unwrap();
        assert_eq!(res, HandleSyscallResult::Skipped(SyscallResult::new(5, 0)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let regs = tracee.registers().unwrap();
        assert_eq!(regs.rdi, 1);
        assert_eq!(regs.rdx, 11);
        assert_eq!(regs.rax, 5);
    }

    #[test]
    fn failing_hooks_are_isolated() {
        let mut registry = HookRegistry::new();
        registry.add_cb_before(1, |_, _| Err("boom".into()));
        registry.add_cb_before(1, |_, _| panic!("hook bug"));
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"9": 1}))));
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"ret": -1}))));
        registry.add_cb_before(1, |ctx, _| {
            ctx.read_bytes(0xdead_0000, 4)?;
            Ok(Some(json!({"0": 99})))
        });
        registry.add_cb_before(1, |_, _| Ok(Some(json!({"1": 2}))));
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(1, [1, BASE, 11, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);

        assert_eq!(
            h.handle_pre_syscall(&tracee, &mut p).unwrap(),
            HandleSyscallResult::ArgumentsReplaced(1)
        );
        let regs = tracee.registers().unwrap();
        assert_eq!((regs.rdi, regs.rsi, regs.rdx), (1, 2, 11));
    }

    #[test]
    fn after_hook_overrides_result_and_ignores_arguments() {
        let mut registry = HookRegistry::new();
        registry.add_cb_after(libc::SYS_openat as u64, |ctx, _| {
            assert_eq!(ctx.result(), Some(SyscallResult::new(3, 0)));
            Ok(Some(json!({"1": 0, "ret": -1, "errno": libc::ENOENT})))
        });
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee
            .set_registers(&entry_regs(libc::SYS_openat as u64, [0, BASE, 0, 0, 0, 0]))
            .unwrap();
        let mut p = process(&tracee);

        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        kernel_runs(&tracee, 3);
        let res = h.handle_post_syscall(&tracee, &mut p).unwrap();

        assert_eq!(res, HandleSyscallResult::ResultReplaced(SyscallResult::new(-1, libc::ENOENT as i64)));
        let regs = tracee.registers().unwrap();
        assert_eq!(regs.rax as i64, -(libc::ENOENT as i64));
        assert_eq!(regs.rsi, BASE);
    }

    #[test]
    fn last_after_hook_result_wins() {
        let mut registry = HookRegistry::new();
        registry.add_cb_after(0, |_, _| Ok(Some(json!({"ret": 1, "errno": 0}))));
        registry.add_cb_after(0, |ctx, _| {
            assert_eq!(ctx.result(), Some(SyscallResult::new(1, 0)));
            Ok(Some(json!({"ret": 2, "errno": 0})))
        });
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(0, [0, BASE, 8, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);

        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        kernel_runs(&tracee, 8);
        h.handle_post_syscall(&tracee, &mut p).unwrap();
        assert_eq!(tracee.registers().unwrap().rax, 2);
    }

    #[test]
    fn local_store_carries_state_from_before_to_after() {
        let mut registry = HookRegistry::new();
        registry.add_cb_before(1, |ctx, _| {
            ctx.persistence_local().set("savedStr", "original");
            Ok(None)
        });
        registry.add_cb_after(1, |ctx, _| {
            let saved = ctx.persistence_local().clear("savedStr");
            Ok(saved.map(|_| json!({"ret": 42, "errno": 0})))
        });
        let h = handler(registry);

        let tracee = MockTracee::new(BASE, 64);
        let other = MockTracee::with_pid(4243, BASE, 64);
        let mut p = process(&tracee);
        let mut q = process(&other);

        tracee.set_registers(&entry_regs(1, [1, BASE, 5, 0, 0, 0])).unwrap();
        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        assert!(p.store().unwrap().contains("savedStr"));
        assert!(q.store().is_none());

        // A different process only sees its own store
        other.set_registers(&entry_regs(0, [0, BASE, 5, 0, 0, 0])).unwrap();
        h.handle_pre_syscall(&other, &mut q).unwrap();
        kernel_runs(&other, 5);
        h.handle_post_syscall(&other, &mut q).unwrap();
        assert!(q.store().map_or(true, |s| s.is_empty()));

        kernel_runs(&tracee, 5);
        let res = h.handle_post_syscall(&tracee, &mut p).unwrap();
        assert_eq!(res, HandleSyscallResult::ResultReplaced(SyscallResult::new(42, 0)));
        assert!(p.store().unwrap().is_empty());
    }

    #[test]
    fn process_filter_excludes_other_programs() {
        let mut registry = HookRegistry::new();
        registry.add_cb_before(49, |_, _| Ok(Some(json!({"ret": -1, "errno": 98}))));
        let mut conf = RuntimeConf::default();
        conf.match_argv0("./server");
        let h = handler_with_conf(registry, conf);

        let mut tracee = MockTracee::new(BASE, 64);
        tracee.set_argv(&["./client"]);
        tracee.set_registers(&entry_regs(49, [3, BASE, 16, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);
        assert_eq!(h.handle_pre_syscall(&tracee, &mut p).unwrap(), HandleSyscallResult::Unchanged);

        let mut server = MockTracee::with_pid(4243, BASE, 64);
        server.set_argv(&["./server", "8080"]);
        server.set_registers(&entry_regs(49, [3, BASE, 16, 0, 0, 0])).unwrap();
        let mut q = process(&server);
        assert!(matches!(
            h.handle_pre_syscall(&server, &mut q).unwrap(),
            HandleSyscallResult::Skipped(_)
        ));
    }

    #[test]
    fn net_sender_round_trip() {
        // Before write: swap the outgoing request and its length, stash the original.
        // After write: restore the original bytes in the caller's buffer.
        const REPLACE: &str = "GET /api/activity?key=4242 HTTP/1.1\r\n\r\n";
        let mut registry = HookRegistry::new();
        registry.add_cb_before(1, |ctx, args| {
            let buf = args[1].as_u64().unwrap_or(0);
            let cnt = args[2].as_u64().unwrap_or(0) as usize;
            let original = String::from_utf8_lossy(&ctx.read_bytes(buf, cnt)?).into_owned();
            if !original.contains("GET") {
                return Ok(None);
            }
            ctx.persistence_local().set("savedStr", original);
            ctx.write_string(buf, REPLACE)?;
            Ok(Some(json!({"2": REPLACE.len()})))
        });
        registry.add_cb_after(1, |ctx, args| {
            let buf = args[1].as_u64().unwrap_or(0);
            if let Some(Value::String(saved)) = ctx.persistence_local().clear("savedStr") {
                ctx.write_string(buf, &saved)?;
            }
            Ok(None)
        });
        let h = handler(registry);

        let original = "GET /api/activity?key=5881028 HTTP/1.1\r\nHost: www.boredapi.com\r\n\r\n";
        let buf = BASE + 0x100;
        let tracee = MockTracee::new(BASE, 0x1000);
        tracee.write_bytes(buf, original.as_bytes()).unwrap();
        tracee
            .set_registers(&entry_regs(1, [3, buf, original.len() as u64, 0, 0, 0]))
            .unwrap();
        let mut p = process(&tracee);

        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        let regs = tracee.registers().unwrap();
        assert_eq!(regs.rdx as usize, REPLACE.len());
        // What the kernel sends
        assert_eq!(tracee.read_bytes(regs.rsi, regs.rdx as usize).unwrap(), REPLACE.as_bytes());

        kernel_runs(&tracee, REPLACE.len() as u64);
        h.handle_post_syscall(&tracee, &mut p).unwrap();

        // What the program sees in its buffer afterwards
        assert_eq!(tracee.read_bytes(buf, original.len()).unwrap(), original.as_bytes());
        assert_eq!(tracee.registers().unwrap().rax as usize, REPLACE.len());
        assert!(!p.store().unwrap().contains("savedStr"));
    }

    #[test]
    fn interrupted_syscall_skips_after_hooks() {
        let after_calls = Arc::new(AtomicUsize::new(0));
        let counter = after_calls.clone();
        let mut registry = HookRegistry::new();
        registry.add_cb_after(0, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!({"ret": 8, "errno": 0})))
        });
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        let mut p = process(&tracee);

        // ERESTARTSYS
        let restart = (-512i64) as u64;
        tracee.set_registers(&entry_regs(0, [0, BASE, 8, 0, 0, 0])).unwrap();
        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        kernel_runs(&tracee, restart);
        assert_eq!(h.handle_post_syscall(&tracee, &mut p).unwrap(), HandleSyscallResult::Unchanged);
        assert_eq!(tracee.registers().unwrap().rax, restart);
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);

        // A plain EINTR is what the program sees, so hooks run
        tracee.set_registers(&entry_regs(0, [0, BASE, 8, 0, 0, 0])).unwrap();
        h.handle_pre_syscall(&tracee, &mut p).unwrap();
        kernel_runs(&tracee, (-libc::EINTR as i64) as u64);
        h.handle_post_syscall(&tracee, &mut p).unwrap();
        assert_eq!(after_calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracee.registers().unwrap().rax, 8);
    }

    #[test]
    fn exit_stop_without_entry_is_ignored() {
        let mut registry = HookRegistry::new();
        registry.add_cb_after(0, |_, _| Ok(Some(json!({"ret": 1, "errno": 0}))));
        let h = handler(registry);
        let tracee = MockTracee::new(BASE, 64);
        tracee.set_registers(&entry_regs(0, [0, BASE, 8, 0, 0, 0])).unwrap();
        let mut p = process(&tracee);
        assert_eq!(h.handle_post_syscall(&tracee, &mut p).unwrap(), HandleSyscallResult::Unchanged);
        assert_eq!(p.state, AttachState::StoppedAtExit);
    }
}
