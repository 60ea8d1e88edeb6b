// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Direct register reads for the calling thread.
//!
//! These must be inlined into the caller so that the values describe the caller's frame. On
//! architectures without an implementation they return 0, which the walker treats as an invalid
//! frame.

use super::RegisterState;

/// Frame pointer of the calling function.
#[inline(always)]
pub fn frame_address() -> usize {
    let fp: usize;
    #[cfg(target_arch = "x86_64")]
    // Safety: reads a register, no memory access.
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    // Safety: reads a register, no memory access.
    unsafe {
        std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        fp = 0;
    }
    fp
}

#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    #[cfg(target_arch = "x86_64")]
    // Safety: reads a register, no memory access.
    unsafe {
        std::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    // Safety: reads a register, no memory access.
    unsafe {
        std::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        sp = 0;
    }
    sp
}

#[inline(always)]
pub fn program_counter() -> usize {
    let pc: usize;
    #[cfg(target_arch = "x86_64")]
    // Safety: computes an address, no memory access.
    unsafe {
        std::arch::asm!("lea {}, [rip]", out(reg) pc, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    // Safety: computes an address, no memory access.
    unsafe {
        std::arch::asm!("adr {}, .", out(reg) pc, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        pc = 0;
    }
    pc
}

/// Registers of the calling thread. The link register is left out: at this point it points into
/// the caller, which the frame walk reports anyway.
#[inline(always)]
pub fn current_register_state() -> RegisterState {
    RegisterState {
        pc: program_counter(),
        lr: None,
        fp: frame_address(),
        sp: stack_pointer(),
    }
}

/// A return address points after the call instruction; symbolication wants the call itself.
#[inline]
pub const fn previous_instruction(addr: usize) -> usize {
    if addr == 0 {
        0
    } else {
        addr - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_current_registers_are_on_the_stack() {
        let local = 0u64;
        let local_addr = &local as *const u64 as usize;
        let regs = current_register_state();
        assert_ne!(regs.pc, 0);
        assert_ne!(regs.sp, 0);
        // The stack grows down: our frame pointer is above the stack pointer and near the local.
        assert!(regs.fp >= regs.sp);
        assert!(local_addr >= regs.sp);
        assert!(local_addr.abs_diff(regs.sp) < 1 << 20);
    }

    #[test]
    fn test_previous_instruction() {
        assert_eq!(previous_instruction(0), 0);
        assert_eq!(previous_instruction(0x1000), 0xfff);
    }
}
