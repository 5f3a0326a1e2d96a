// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Darwin `ucontext_t` conversion. The thread state hangs off a pointer in
//! the ucontext rather than being embedded.

use super::CpuContext;
use libc::ucontext_t;

#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn parse_ucontext(uc: *const ucontext_t, context: &mut CpuContext) {
    let ss = &(*(*uc).uc_mcontext).__ss;

    context.rip = ss.__rip;

    context.r15 = ss.__r15;
    context.r14 = ss.__r14;
    context.r13 = ss.__r13;
    context.r12 = ss.__r12;
    context.r11 = ss.__r11;
    context.r10 = ss.__r10;
    context.r9 = ss.__r9;
    context.r8 = ss.__r8;

    context.rdi = ss.__rdi;
    context.rsi = ss.__rsi;
    context.rbp = ss.__rbp;
    context.rsp = ss.__rsp;
    context.rbx = ss.__rbx;
    context.rdx = ss.__rdx;
    context.rcx = ss.__rcx;
    context.rax = ss.__rax;
}

#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn unparse_ucontext(context: &CpuContext, uc: *mut ucontext_t) {
    let ss = &mut (*(*uc).uc_mcontext).__ss;

    ss.__rip = context.rip;

    ss.__r15 = context.r15;
    ss.__r14 = context.r14;
    ss.__r13 = context.r13;
    ss.__r12 = context.r12;
    ss.__r11 = context.r11;
    ss.__r10 = context.r10;
    ss.__r9 = context.r9;
    ss.__r8 = context.r8;

    ss.__rdi = context.rdi;
    ss.__rsi = context.rsi;
    ss.__rbp = context.rbp;
    ss.__rsp = context.rsp;
    ss.__rbx = context.rbx;
    ss.__rdx = context.rdx;
    ss.__rcx = context.rcx;
    ss.__rax = context.rax;
}

#[cfg(target_arch = "aarch64")]
pub(super) unsafe fn parse_ucontext(uc: *const ucontext_t, context: &mut CpuContext) {
    let mc = &*(*uc).uc_mcontext;
    let ss = &mc.__ss;

    context.pc = ss.__pc;
    context.sp = ss.__sp;

    context.x.copy_from_slice(&ss.__x);
    context.fp = ss.__fp;
    context.lr = ss.__lr;

    std::ptr::copy_nonoverlapping(
        mc.__ns.__v.as_ptr() as *const u8,
        context.q.as_mut_ptr(),
        context.q.len(),
    );
}

#[cfg(target_arch = "aarch64")]
pub(super) unsafe fn unparse_ucontext(context: &CpuContext, uc: *mut ucontext_t) {
    let mc = &mut *(*uc).uc_mcontext;
    let ss = &mut mc.__ss;

    ss.__pc = context.pc;
    ss.__sp = context.sp;

    ss.__x.copy_from_slice(&context.x);
    ss.__fp = context.fp;
    ss.__lr = context.lr;

    std::ptr::copy_nonoverlapping(
        context.q.as_ptr(),
        mc.__ns.__v.as_mut_ptr() as *mut u8,
        context.q.len(),
    );
}
