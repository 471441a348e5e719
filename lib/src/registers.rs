use crate::error::{Result, TraceError};
use crate::memory::Tracee;
use crate::platforms::{PlatformHandler, MAX_ARGS};
use crate::process_state::AttachState;
use crate::syscalls::{Phase, SyscallEvent, SyscallRegs, SyscallResult};

/// Syscall-level view of a stopped tracee's registers
///
/// Registers are fetched once per stop; every mutation is written back immediately so that a
/// failed write never leaves a partially applied change behind in the cache only.
pub struct RegisterAccessor<'a> {
    tracee: &'a dyn Tracee,
    platform: &'a dyn PlatformHandler,
    state: AttachState,
    regs: SyscallRegs,
}

impl<'a> RegisterAccessor<'a> {
    pub fn load(
        tracee: &'a dyn Tracee,
        platform: &'a dyn PlatformHandler,
        state: AttachState,
    ) -> Result<Self> {
        let regs = tracee.registers()?;
        Ok(Self {
            tracee,
            platform,
            state,
            regs,
        })
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn sysno(&self) -> u64 {
        self.platform.syscall_number(&self.regs)
    }

    /// The syscall as seen at this stop; only valid at an entry or exit stop
    pub fn syscall_event(&self) -> Result<SyscallEvent> {
        let (phase, result) = match self.state {
            AttachState::StoppedAtEntry => (Phase::Before, None),
            AttachState::StoppedAtExit => (
                Phase::After,
                Some(SyscallResult::from_raw(self.platform.return_value(&self.regs))),
            ),
            state => {
                return Err(TraceError::InvalidState {
                    op: "syscall_event",
                    state,
                })
            }
        };
        Ok(SyscallEvent {
            pid: self.tracee.pid(),
            sysno: self.sysno(),
            args: self.platform.arguments(&self.regs),
            phase,
            result,
        })
    }

    /// Replaces one argument before the kernel reads it
    pub fn set_argument(&mut self, index: usize, value: u64) -> Result<()> {
        self.require(AttachState::StoppedAtEntry, "set_argument")?;
        if index >= MAX_ARGS {
            return Err(TraceError::MalformedDirective(format!(
                "argument index {} out of range",
                index
            )));
        }
        let mut regs = self.regs;
        self.platform.set_argument(&mut regs, index, value);
        self.store(regs)
    }

    /// Sets what the tracee will observe as the syscall's result
    pub fn set_return_and_errno(&mut self, result: SyscallResult) -> Result<()> {
        match self.state {
            AttachState::StoppedAtEntry | AttachState::StoppedAtExit => (),
            state => {
                return Err(TraceError::InvalidState {
                    op: "set_return_and_errno",
                    state,
                })
            }
        }
        let mut regs = self.regs;
        self.platform.set_return_value(&mut regs, result.to_raw());
        self.store(regs)
    }

    /// Prevents the kernel from executing the pending syscall
    pub fn skip_syscall(&mut self) -> Result<()> {
        self.require(AttachState::StoppedAtEntry, "skip_syscall")?;
        let mut regs = self.regs;
        self.platform.skip(&mut regs);
        self.store(regs)
    }

    fn require(&self, expected: AttachState, op: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(TraceError::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn store(&mut self, regs: SyscallRegs) -> Result<()> {
        self.tracee.set_registers(&regs)?;
        self.regs = regs;
        Ok(())
    }
}

/// Runs `sysno` in the stopped tracee and returns its result, leaving the thread in the same
/// stop with the same registers it was in before
///
/// At an entry stop the pending syscall number is swapped for `sysno`; once it has run, the
/// thread is rewound onto its syscall instruction so the interrupted syscall is entered again.
/// At an exit stop the thread is rewound first, runs `sysno` through a fresh entry and exit, and
/// gets its original registers back.
pub fn inject_syscall(
    tracee: &dyn Tracee,
    platform: &dyn PlatformHandler,
    state: AttachState,
    sysno: u64,
    args: &[u64],
) -> Result<SyscallResult> {
    if args.len() > MAX_ARGS {
        return Err(TraceError::Handler(format!(
            "{} arguments given, a syscall takes at most {}",
            args.len(),
            MAX_ARGS
        )));
    }
    let saved = tracee.registers()?;
    let mut regs = saved;
    for (index, &value) in args.iter().enumerate() {
        platform.set_argument(&mut regs, index, value);
    }

    match state {
        AttachState::StoppedAtEntry => {
            platform.set_syscall_number(&mut regs, sysno);
            tracee.set_registers(&regs)?;
            tracee.step_syscall()?;
            let raw = platform.return_value(&tracee.registers()?);

            let mut again = saved;
            platform.rewind_to_syscall(&mut again, platform.syscall_number(&saved));
            tracee.set_registers(&again)?;
            tracee.step_syscall()?;
            tracee.set_registers(&saved)?;
            Ok(SyscallResult::from_raw(raw))
        }
        AttachState::StoppedAtExit => {
            platform.rewind_to_syscall(&mut regs, sysno);
            tracee.set_registers(&regs)?;
            tracee.step_syscall()?;
            tracee.step_syscall()?;
            let raw = platform.return_value(&tracee.registers()?);
            tracee.set_registers(&saved)?;
            Ok(SyscallResult::from_raw(raw))
        }
        state => Err(TraceError::InvalidState {
            op: "inject_syscall",
            state,
        }),
    }
}
