#[cfg(target_arch = "x86_64")]
pub mod linux_x86_64;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("syshook currently only supports the x86_64 Linux syscall convention");

use crate::syscalls::SyscallRegs;

/// Number of positional syscall arguments a calling convention passes in registers
pub const MAX_ARGS: usize = 6;

/// Syscall calling convention of one architecture
pub trait PlatformHandler: Send + Sync {
    fn syscall_number(&self, regs: &SyscallRegs) -> u64;

    fn arguments(&self, regs: &SyscallRegs) -> [u64; MAX_ARGS];

    /// Returns false, leaving `regs` untouched, if `index >= MAX_ARGS`
    fn set_argument(&self, regs: &mut SyscallRegs, index: usize, value: u64) -> bool;

    fn return_value(&self, regs: &SyscallRegs) -> u64;

    fn set_return_value(&self, regs: &mut SyscallRegs, value: u64);

    /// Replaces the pending syscall number with one the kernel never executes
    fn skip(&self, regs: &mut SyscallRegs);

    /// Changes which syscall the kernel executes; only meaningful at an entry stop
    fn set_syscall_number(&self, regs: &mut SyscallRegs, sysno: u64);

    /// Points the thread back at the syscall instruction it stopped after, with `sysno` where
    /// the instruction reads the syscall number from
    fn rewind_to_syscall(&self, regs: &mut SyscallRegs, sysno: u64);

    fn syscall_name(&self, sysno: u64) -> Option<&'static str>;

    fn syscall_number_by_name(&self, name: &str) -> Option<u64>;
}

#[cfg(target_arch = "x86_64")]
pub use linux_x86_64::Handler as NativeHandler;
