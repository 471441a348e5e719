use nix::unistd::Pid;
use std::cell::{Cell, RefCell};

use crate::error::{Result, TraceError};
use crate::memory::Tracee;
use crate::platforms::MAX_ARGS;
use crate::syscalls::SyscallRegs;

pub const MOCK_PID: i32 = 4242;

pub fn zeroed_regs() -> SyscallRegs {
    unsafe { std::mem::zeroed() }
}

/// Registers of a thread stopped at the entry of `sysno`
pub fn entry_regs(sysno: u64, args: [u64; MAX_ARGS]) -> SyscallRegs {
    let mut regs = zeroed_regs();
    regs.orig_rax = sysno;
    regs.rax = (-libc::ENOSYS as i64) as u64;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
    regs
}

/// In-memory tracee: one mapped region starting at `base`, plus a register file
pub struct MockTracee {
    pid: Pid,
    base: u64,
    memory: RefCell<Vec<u8>>,
    regs: RefCell<SyscallRegs>,
    register_writes: Cell<usize>,
    argv: Vec<String>,
    at_exit: Cell<bool>,
    executed: RefCell<Vec<(u64, [u64; MAX_ARGS])>>,
}

impl MockTracee {
    pub fn new(base: u64, size: usize) -> Self {
        Self::with_pid(MOCK_PID, base, size)
    }

    pub fn with_pid(pid: i32, base: u64, size: usize) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            base,
            memory: RefCell::new(vec![0; size]),
            regs: RefCell::new(zeroed_regs()),
            register_writes: Cell::new(0),
            argv: vec![String::from("./mock")],
            at_exit: Cell::new(false),
            executed: RefCell::new(Vec::new()),
        }
    }

    /// Whether `step_syscall` treats the thread as stopped at a syscall exit
    pub fn at_exit(&self) -> bool {
        self.at_exit.get()
    }

    pub fn set_at_exit(&self, at_exit: bool) {
        self.at_exit.set(at_exit);
    }

    /// Syscalls run by `step_syscall` so far, with their arguments
    pub fn executed(&self) -> Vec<(u64, [u64; MAX_ARGS])> {
        self.executed.borrow().clone()
    }

    pub fn set_argv(&mut self, argv: &[&str]) {
        self.argv = argv.iter().map(|s| s.to_string()).collect();
    }

    /// Number of `set_registers` calls so far
    pub fn register_writes(&self) -> usize {
        self.register_writes.get()
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let size = self.memory.borrow().len() as u64;
        if addr < self.base || addr - self.base + len as u64 > size {
            return Err(TraceError::MemoryAccess {
                pid: self.pid,
                addr,
                len,
                reason: String::from("Bad address"),
            });
        }
        let start = (addr - self.base) as usize;
        Ok(start..start + len)
    }
}

impl Tracee for MockTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.range(addr, len)?;
        Ok(self.memory.borrow()[range].to_vec())
    }

    fn write_bytes(&self, addr: u64, bytes: &[u8]) -> Result<usize> {
        let range = self.range(addr, bytes.len())?;
        self.memory.borrow_mut()[range].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn registers(&self) -> Result<SyscallRegs> {
        Ok(*self.regs.borrow())
    }

    fn set_registers(&self, regs: &SyscallRegs) -> Result<()> {
        *self.regs.borrow_mut() = *regs;
        self.register_writes.set(self.register_writes.get() + 1);
        Ok(())
    }

    /// Emulates the kernel: from an entry stop the syscall runs (`mmap` maps at the start of the
    /// mock memory, `munmap` succeeds, anything else fails with `ENOSYS`); from an exit stop the
    /// rewound syscall instruction is entered again
    fn step_syscall(&self) -> Result<()> {
        let mut regs = self.regs.borrow_mut();
        if self.at_exit.get() {
            regs.orig_rax = regs.rax;
            regs.rax = (-libc::ENOSYS as i64) as u64;
            regs.rip = regs.rip.wrapping_add(2);
        } else {
            let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
            self.executed.borrow_mut().push((regs.orig_rax, args));
            regs.rax = match regs.orig_rax as i64 {
                libc::SYS_mmap => self.base,
                libc::SYS_munmap => 0,
                _ => (-libc::ENOSYS as i64) as u64,
            };
        }
        self.at_exit.set(!self.at_exit.get());
        Ok(())
    }

    fn argv(&self) -> Result<Vec<String>> {
        Ok(self.argv.clone())
    }

    fn envs(&self) -> Result<Vec<String>> {
        Ok(vec![String::from("PATH=/usr/bin")])
    }

    fn mmaps(&self) -> Result<String> {
        Ok(format!(
            "{:x}-{:x} rw-p 00000000 00:00 0 [heap]\n",
            self.base,
            self.base + self.memory.borrow().len() as u64
        ))
    }

    fn fds(&self) -> Result<Vec<(i32, String)>> {
        Ok(vec![
            (0, String::from("/dev/null")),
            (1, String::from("pipe:[1]")),
        ])
    }
}
