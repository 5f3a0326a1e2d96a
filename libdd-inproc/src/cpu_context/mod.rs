// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical, architecture-tagged register file.
//!
//! The exception machinery and compiled C modules share this layout, so the
//! struct is `repr(C)` and mirrored verbatim in the builtin header. The only
//! place OS-specific context-blob knowledge lives is the per-OS conversion
//! shim ([`linux`] / [`darwin`]).

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod darwin;

use libc::c_void;

/// Register file for the architecture this crate is compiled for.
///
/// Field order is ABI: compiled C modules index into this structure through
/// the `DdogCpuContext` definition in the builtin header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg(target_arch = "x86")]
pub struct CpuContext {
    pub eip: u32,

    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg(target_arch = "x86_64")]
pub struct CpuContext {
    pub rip: u64,

    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,

    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg(target_arch = "arm")]
pub struct CpuContext {
    pub cpsr: u32,
    pub pc: u32,
    pub sp: u32,

    pub r8: u32,
    pub r9: u32,
    pub r10: u32,
    pub r11: u32,
    pub r12: u32,

    pub r: [u32; 8],
    pub lr: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg(target_arch = "aarch64")]
pub struct CpuContext {
    pub pc: u64,
    pub sp: u64,

    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub q: [u8; 128],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
pub struct CpuContext {
    pub pc: usize,

    pub gp: usize,
    pub sp: usize,
    pub fp: usize,
    pub ra: usize,

    pub hi: usize,
    pub lo: usize,

    pub at: usize,

    pub v0: usize,
    pub v1: usize,

    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,

    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    pub t7: usize,
    pub t8: usize,
    pub t9: usize,

    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,

    pub k0: usize,
    pub k1: usize,
}

impl Default for CpuContext {
    fn default() -> Self {
        // SAFETY: every field is a plain integer or integer array.
        unsafe { std::mem::zeroed() }
    }
}

impl CpuContext {
    /// Address of the instruction the thread is about to (re-)execute.
    pub fn instruction_pointer(&self) -> usize {
        #[cfg(target_arch = "x86")]
        return self.eip as usize;
        #[cfg(target_arch = "x86_64")]
        return self.rip as usize;
        #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
        return self.pc as usize;
        #[cfg(any(target_arch = "mips", target_arch = "mips64"))]
        return self.pc;
    }

    /// Redirects the thread: on resume it continues at `address`.
    pub fn set_instruction_pointer(&mut self, address: usize) {
        #[cfg(target_arch = "x86")]
        {
            self.eip = address as u32;
        }
        #[cfg(target_arch = "x86_64")]
        {
            self.rip = address as u64;
        }
        #[cfg(target_arch = "arm")]
        {
            self.pc = address as u32;
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.pc = address as u64;
        }
        #[cfg(any(target_arch = "mips", target_arch = "mips64"))]
        {
            self.pc = address;
        }
    }

    pub fn stack_pointer(&self) -> usize {
        #[cfg(target_arch = "x86")]
        return self.esp as usize;
        #[cfg(target_arch = "x86_64")]
        return self.rsp as usize;
        #[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
        return self.sp as usize;
        #[cfg(any(target_arch = "mips", target_arch = "mips64"))]
        return self.sp;
    }
}

/// Converts the kernel-native context blob delivered to a signal handler
/// into the canonical register file.
///
/// # Safety
/// `native` must point at the `ucontext_t`-like structure passed to an
/// `SA_SIGINFO` handler on this OS.
pub unsafe fn parse_native_context(native: *const c_void) -> CpuContext {
    let mut context = CpuContext::default();
    #[cfg(target_os = "linux")]
    linux::parse_ucontext(native.cast(), &mut context);
    #[cfg(target_os = "macos")]
    darwin::parse_ucontext(native.cast(), &mut context);
    context
}

/// Writes the canonical register file back into the kernel-native context
/// blob, steering where the faulting thread resumes.
///
/// # Safety
/// `native` must point at the same structure previously given to
/// [`parse_native_context`] for this signal delivery.
pub unsafe fn unparse_native_context(context: &CpuContext, native: *mut c_void) {
    #[cfg(target_os = "linux")]
    linux::unparse_ucontext(context, native.cast());
    #[cfg(target_os = "macos")]
    darwin::unparse_ucontext(context, native.cast());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zeroed() {
        let context = CpuContext::default();
        assert_eq!(context.instruction_pointer(), 0);
        assert_eq!(context.stack_pointer(), 0);
    }

    #[test]
    fn test_instruction_pointer_roundtrip() {
        let mut context = CpuContext::default();
        context.set_instruction_pointer(0xdead_b000);
        assert_eq!(context.instruction_pointer(), 0xdead_b000);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_ucontext_roundtrip() {
        // SAFETY: ucontext_t is plain data; a zeroed instance is a valid
        // (if meaningless) register snapshot.
        let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x1122_3344_5566_7788;
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7fff_0000_1000;
        uc.uc_mcontext.gregs[libc::REG_RAX as usize] = 42;
        uc.uc_mcontext.gregs[libc::REG_R9 as usize] = 9;

        let mut context = unsafe { parse_native_context(&uc as *const _ as *const c_void) };
        assert_eq!(context.rip, 0x1122_3344_5566_7788);
        assert_eq!(context.rsp, 0x7fff_0000_1000);
        assert_eq!(context.rax, 42);
        assert_eq!(context.r9, 9);

        context.rax = 43;
        context.set_instruction_pointer(0x4000);
        unsafe { unparse_native_context(&context, &mut uc as *mut _ as *mut c_void) };
        assert_eq!(uc.uc_mcontext.gregs[libc::REG_RAX as usize], 43);
        assert_eq!(uc.uc_mcontext.gregs[libc::REG_RIP as usize], 0x4000);
        // Untouched registers survive the roundtrip.
        assert_eq!(uc.uc_mcontext.gregs[libc::REG_R9 as usize], 9);
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[test]
    fn test_ucontext_roundtrip() {
        let mut uc: libc::ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.pc = 0x1122_3344;
        uc.uc_mcontext.sp = 0x7fff_1000;
        uc.uc_mcontext.regs[0] = 42;
        uc.uc_mcontext.regs[29] = 0xf0;
        uc.uc_mcontext.regs[30] = 0x8000;

        let mut context = unsafe { parse_native_context(&uc as *const _ as *const c_void) };
        assert_eq!(context.pc, 0x1122_3344);
        assert_eq!(context.sp, 0x7fff_1000);
        assert_eq!(context.x[0], 42);
        assert_eq!(context.lr, 0x8000);

        context.x[0] = 43;
        unsafe { unparse_native_context(&context, &mut uc as *mut _ as *mut c_void) };
        assert_eq!(uc.uc_mcontext.regs[0], 43);
        assert_eq!(uc.uc_mcontext.regs[30], 0x8000);
    }
}
