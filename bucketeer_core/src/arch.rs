//! Architecture specific pieces of crash inspection: the register snapshot,
//! where the frame pointer lives in it, and which signals count as faults.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("frame-pointer walking is only implemented for x86_64 and aarch64");

/// Size of one stack word read from the tracee.
pub const WORD_SIZE: u64 = 8;

pub type Registers = libc::user_regs_struct;

/// Reads the full register snapshot of a stopped tracee.
pub fn read_registers(pid: Pid) -> nix::Result<Registers> {
    ptrace::getregs(pid)
}

#[cfg(target_arch = "x86_64")]
pub fn frame_pointer_of(registers: &Registers) -> u64 {
    registers.rbp
}

// x29 holds the frame pointer under AAPCS64.
#[cfg(target_arch = "aarch64")]
pub fn frame_pointer_of(registers: &Registers) -> u64 {
    registers.regs[29]
}

/// Signals that are taken as evidence of a genuine crash.
pub fn is_fault_signal(signal: Signal) -> bool {
    matches!(signal, Signal::SIGILL | Signal::SIGABRT | Signal::SIGSEGV)
}
