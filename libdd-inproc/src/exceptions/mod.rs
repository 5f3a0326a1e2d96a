// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CPU exception interception.
//!
//! One trampoline handler is installed across a fixed signal set. On
//! delivery it classifies the fault, hands an [`ExceptionDetails`] to the
//! user handler, and either resumes the faulting thread with a possibly
//! mutated register state or chains to whatever handler the host program
//! had installed. `signal`/`sigaction` are virtualized while a backend is
//! attached so host installs land in the saved-dispositions table instead
//! of the kernel.

mod backend;
mod dispositions;
mod memory_access;

pub use backend::{
    prepare_to_fork, recover_from_fork_in_child, recover_from_fork_in_parent, ExceptionBackend,
    MANAGED_SIGNALS,
};

use crate::cpu_context::CpuContext;
use libc::c_void;

/// Broad category of a delivered exception, derived from the signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Abort,
    AccessViolation,
    IllegalInstruction,
    Arithmetic,
    Breakpoint,
    System,
}

impl ExceptionKind {
    pub(crate) fn from_signal(signum: libc::c_int) -> Self {
        match signum {
            libc::SIGABRT => ExceptionKind::Abort,
            libc::SIGSEGV | libc::SIGBUS => ExceptionKind::AccessViolation,
            libc::SIGILL => ExceptionKind::IllegalInstruction,
            libc::SIGFPE => ExceptionKind::Arithmetic,
            libc::SIGTRAP => ExceptionKind::Breakpoint,
            _ => ExceptionKind::System,
        }
    }
}

/// What the faulting instruction was doing to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperation {
    Invalid,
    Read,
    Write,
    Execute,
}

/// Memory sub-detail of an access violation. For non-memory faults the
/// operation is [`MemoryOperation::Invalid`] and the address is null.
#[derive(Debug, Clone, Copy)]
pub struct MemoryAccessDetails {
    pub operation: MemoryOperation,
    pub address: *mut c_void,
}

/// Everything a handler gets to see about one fault. `context` may be
/// mutated to steer where and with which register state the thread
/// resumes; `native_context` points at the raw kernel structure for rare
/// deep inspection.
pub struct ExceptionDetails {
    pub thread_id: i64,
    pub kind: ExceptionKind,
    pub address: *mut c_void,
    pub memory: MemoryAccessDetails,
    pub context: CpuContext,
    pub native_context: *mut c_void,
}

/// User callback invoked on every managed fault. Returning `true` resumes
/// the faulting thread with the (possibly mutated) context; `false` chains
/// to the previously installed handler.
pub type ExceptionHandler = fn(&mut ExceptionDetails, *mut c_void) -> bool;
