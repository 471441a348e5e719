mod names;

use crate::platforms::{PlatformHandler, MAX_ARGS};
use crate::syscalls::SyscallRegs;

/// Length of both `syscall` and `int 0x80`
const SYSCALL_INSN_LEN: u64 = 2;

/// x86_64 convention: number in `orig_rax`, arguments in rdi, rsi, rdx, r10, r8, r9, result in
/// `rax`
#[derive(Debug, Default, Clone, Copy)]
pub struct Handler;

impl Handler {
    pub fn new() -> Self {
        Self
    }
}

impl PlatformHandler for Handler {
    fn syscall_number(&self, regs: &SyscallRegs) -> u64 {
        regs.orig_rax
    }

    fn arguments(&self, regs: &SyscallRegs) -> [u64; MAX_ARGS] {
        [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]
    }

    fn set_argument(&self, regs: &mut SyscallRegs, index: usize, value: u64) -> bool {
        let reg = match index {
            0 => &mut regs.rdi,
            1 => &mut regs.rsi,
            2 => &mut regs.rdx,
            3 => &mut regs.r10,
            4 => &mut regs.r8,
            5 => &mut regs.r9,
            _ => return false,
        };
        *reg = value;
        true
    }

    fn return_value(&self, regs: &SyscallRegs) -> u64 {
        regs.rax
    }

    fn set_return_value(&self, regs: &mut SyscallRegs, value: u64) {
        regs.rax = value;
    }

    fn skip(&self, regs: &mut SyscallRegs) {
        regs.orig_rax = u64::MAX;
    }

    fn set_syscall_number(&self, regs: &mut SyscallRegs, sysno: u64) {
        regs.orig_rax = sysno;
    }

    fn rewind_to_syscall(&self, regs: &mut SyscallRegs, sysno: u64) {
        regs.rip = regs.rip.wrapping_sub(SYSCALL_INSN_LEN);
        regs.rax = sysno;
    }

    fn syscall_name(&self, sysno: u64) -> Option<&'static str> {
        names::SYSCALL_NAMES
            .iter()
            .find(|(_, no)| *no as u64 == sysno)
            .map(|(name, _)| *name)
    }

    fn syscall_number_by_name(&self, name: &str) -> Option<u64> {
        names::SYSCALL_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, no)| *no as u64)
    }
}
